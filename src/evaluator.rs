//! Runs synth scripts.
//!
//! The script is interpreted, never compiled or linked: the factory sees
//! exactly two capabilities, the audio namespace (constructors and routing
//! helpers) and the shared output node. Everything it builds is returned as
//! a [`SynthSet`] for the caller to install.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info};

use crate::effects::{
    reaches, Distortion, Effect, EffectHandle, FeedbackDelay, Filter, FilterType, Reverb,
};
use crate::graph::Link;
use crate::script::{self, Expr, Function, Script, Stmt};
use crate::synth::{SynthHandle, SynthSet, ToneSynth, VoiceKind, VoiceParams, Waveform};

/// Name of the function a script must define.
pub const FACTORY: &str = "create_synth";

const MAX_CALL_DEPTH: usize = 64;
/// Bounds expression recursion across all calls.
const MAX_EXPR_DEPTH: usize = 256;
const MAX_INSTRUMENTS: usize = 16;
const MAX_POLYPHONY: usize = 64;
const DEFAULT_POLYPHONY: usize = 32;

/// Why a script did not produce any synths.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// The script defines no `create_synth` function.
    MissingFactory,
    /// The factory returned nothing.
    EmptyResult,
    /// Syntax or runtime error, with a readable message.
    Script(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFactory => write!(f, "{}() was not found", FACTORY),
            Self::EmptyResult => write!(f, "Nothing was returned from {}()", FACTORY),
            Self::Script(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<script::ParseError> for EvalError {
    fn from(err: script::ParseError) -> Self {
        Self::Script(format!("syntax error at {}", err))
    }
}

/// Evaluates `source` off the calling thread and returns the synths its
/// factory built.
pub async fn evaluate(source: String) -> Result<SynthSet, EvalError> {
    match tokio::task::spawn_blocking(move || evaluate_source(&source)).await {
        Ok(result) => result,
        Err(e) => Err(EvalError::Script(format!("evaluation aborted: {}", e))),
    }
}

/// Parses `source` and invokes its factory.
pub fn evaluate_source(source: &str) -> Result<SynthSet, EvalError> {
    let script = script::parse(source)?;
    let factory = script.function(FACTORY).ok_or(EvalError::MissingFactory)?;
    debug!(
        "Invoking {}{} (line {}, {} statements)",
        if factory.is_async { "async " } else { "" },
        FACTORY,
        factory.line,
        factory.body.len()
    );

    // the factory may ignore either capability
    let capabilities = [Value::Namespace, Value::Output]
        .into_iter()
        .take(factory.params.len())
        .collect();
    let mut interpreter = Interpreter::new(&script);
    let result = interpreter
        .call(factory, capabilities)
        .map_err(EvalError::Script)?;

    let synths = collect_synths(result)?;
    info!("{} built {} synth(s)", FACTORY, synths.len());
    Ok(SynthSet::new(synths))
}

fn collect_synths(value: Value) -> Result<Vec<SynthHandle>, EvalError> {
    let values = match value {
        Value::Unit => return Err(EvalError::EmptyResult),
        Value::List(values) => values,
        other => vec![other],
    };
    if values.is_empty() {
        return Err(EvalError::EmptyResult);
    }

    values
        .into_iter()
        .map(|value| match value {
            Value::Synth(handle) => Ok(handle),
            other => Err(EvalError::Script(format!(
                "{}() must return synths, got {}",
                FACTORY,
                other.type_name()
            ))),
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum VoiceCtor {
    Synth,
    MonoSynth,
    FmSynth,
    AmSynth,
    MembraneSynth,
}

impl VoiceCtor {
    fn name(self) -> &'static str {
        match self {
            VoiceCtor::Synth => "Synth",
            VoiceCtor::MonoSynth => "MonoSynth",
            VoiceCtor::FmSynth => "FMSynth",
            VoiceCtor::AmSynth => "AMSynth",
            VoiceCtor::MembraneSynth => "MembraneSynth",
        }
    }
}

/// Members of the audio namespace.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Builtin {
    Voice(VoiceCtor),
    PolySynth,
    Reverb,
    FeedbackDelay,
    Filter,
    Distortion,
    Volume,
    ConnectSeries,
    Connect,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Synth" => Builtin::Voice(VoiceCtor::Synth),
            "MonoSynth" => Builtin::Voice(VoiceCtor::MonoSynth),
            "FMSynth" => Builtin::Voice(VoiceCtor::FmSynth),
            "AMSynth" => Builtin::Voice(VoiceCtor::AmSynth),
            "MembraneSynth" => Builtin::Voice(VoiceCtor::MembraneSynth),
            "PolySynth" => Builtin::PolySynth,
            "Reverb" => Builtin::Reverb,
            "FeedbackDelay" => Builtin::FeedbackDelay,
            "Filter" => Builtin::Filter,
            "Distortion" => Builtin::Distortion,
            "Volume" => Builtin::Volume,
            "connect_series" => Builtin::ConnectSeries,
            "connect" => Builtin::Connect,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Builtin::Voice(voice) => voice.name(),
            Builtin::PolySynth => "PolySynth",
            Builtin::Reverb => "Reverb",
            Builtin::FeedbackDelay => "FeedbackDelay",
            Builtin::Filter => "Filter",
            Builtin::Distortion => "Distortion",
            Builtin::Volume => "Volume",
            Builtin::ConnectSeries => "connect_series",
            Builtin::Connect => "connect",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Method {
    Connect,
    ToDestination,
}

#[derive(Clone)]
enum Value {
    Unit,
    Number(f64),
    Str(String),
    List(Vec<Value>),
    Namespace,
    Output,
    Builtin(Builtin),
    Function(String),
    Synth(SynthHandle),
    Effect(EffectHandle),
    Method(Box<Value>, Method),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "nothing",
            Value::Number(_) => "a number",
            Value::Str(_) => "a string",
            Value::List(_) => "a list",
            Value::Namespace => "the audio namespace",
            Value::Output => "the output node",
            Value::Builtin(_) | Value::Function(_) | Value::Method(..) => "a function",
            Value::Synth(_) => "a synth",
            Value::Effect(_) => "an effect",
        }
    }
}

type Scope = HashMap<String, Value>;

struct Interpreter<'s> {
    script: &'s Script,
    depth: usize,
    expr_depth: usize,
    instruments: usize,
}

impl<'s> Interpreter<'s> {
    fn new(script: &'s Script) -> Self {
        Self {
            script,
            depth: 0,
            expr_depth: 0,
            instruments: 0,
        }
    }

    fn call(&mut self, function: &'s Function, args: Vec<Value>) -> Result<Value, String> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(format!(
                "too many nested calls (limit {}) in {}()",
                MAX_CALL_DEPTH, function.name
            ));
        }
        if args.len() > function.params.len() {
            return Err(format!(
                "{}() takes {} argument(s) but {} were given",
                function.name,
                function.params.len(),
                args.len()
            ));
        }

        let mut scope: Scope = function.params.iter().cloned().zip(args).collect();

        self.depth += 1;
        let result = self.run(&function.body, &mut scope);
        self.depth -= 1;
        result
    }

    fn run(&mut self, body: &'s [Stmt], scope: &mut Scope) -> Result<Value, String> {
        for stmt in body {
            match stmt {
                Stmt::Let { name, value } => {
                    let value = self.eval(value, scope)?;
                    scope.insert(name.clone(), value);
                }
                Stmt::Expr(expr) => {
                    self.eval(expr, scope)?;
                }
                Stmt::Return(exprs) => {
                    let mut values = exprs
                        .iter()
                        .map(|e| self.eval(e, scope))
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(match values.len() {
                        0 => Value::Unit,
                        1 => values.remove(0),
                        _ => Value::List(values),
                    });
                }
            }
        }
        Ok(Value::Unit)
    }

    fn eval(&mut self, expr: &'s Expr, scope: &Scope) -> Result<Value, String> {
        if self.expr_depth >= MAX_EXPR_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        self.expr_depth += 1;
        let result = self.eval_expr(expr, scope);
        self.expr_depth -= 1;
        result
    }

    fn eval_expr(&mut self, expr: &'s Expr, scope: &Scope) -> Result<Value, String> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Ident(name) => {
                if let Some(value) = scope.get(name) {
                    Ok(value.clone())
                } else if self.script.function(name).is_some() {
                    Ok(Value::Function(name.clone()))
                } else {
                    Err(format!("`{}` is not defined", name))
                }
            }
            Expr::Member { target, name } => {
                let target = self.eval(target, scope)?;
                member(target, name)
            }
            Expr::Call { callee, args } => {
                let callee = self.eval(callee, scope)?;
                let mut positional = Vec::new();
                let mut named = Vec::new();
                for arg in args {
                    let value = self.eval(&arg.value, scope)?;
                    match &arg.name {
                        Some(name) => named.push((name.clone(), value)),
                        None => positional.push(value),
                    }
                }
                self.apply(callee, positional, named)
            }
        }
    }

    fn apply(
        &mut self,
        callee: Value,
        positional: Vec<Value>,
        named: Vec<(String, Value)>,
    ) -> Result<Value, String> {
        match callee {
            Value::Function(name) => {
                if !named.is_empty() {
                    return Err(format!("{}() does not take named arguments", name));
                }
                let script = self.script;
                let function = script
                    .function(&name)
                    .ok_or_else(|| format!("`{}` is not defined", name))?;
                self.call(function, positional)
            }
            Value::Builtin(builtin) => self.construct(builtin, positional, named),
            Value::Method(target, method) => {
                if !named.is_empty() {
                    return Err("methods do not take named arguments".to_string());
                }
                call_method(*target, method, positional)
            }
            other => Err(format!("{} is not callable", other.type_name())),
        }
    }

    fn construct(
        &mut self,
        builtin: Builtin,
        mut positional: Vec<Value>,
        named: Vec<(String, Value)>,
    ) -> Result<Value, String> {
        debug!("Calling tone.{}", builtin.name());
        match builtin {
            Builtin::ConnectSeries => {
                if !named.is_empty() || positional.len() < 2 {
                    return Err("connect_series() needs at least two nodes".to_string());
                }
                for pair in positional.windows(2) {
                    connect(&pair[0], &pair[1])?;
                }
                Ok(positional.remove(0))
            }
            Builtin::Connect => {
                if !named.is_empty() || positional.len() != 2 {
                    return Err("connect() needs a source and a destination".to_string());
                }
                connect(&positional[0], &positional[1])?;
                Ok(positional.remove(0))
            }
            Builtin::Voice(voice) => {
                let mut options = Options::new(voice.name(), &[], positional, named)?;
                let params = voice_params(voice, &mut options)?;
                options.finish()?;
                self.instrument(ToneSynth::mono(params))
            }
            Builtin::PolySynth => {
                let voice = match positional.first() {
                    Some(Value::Builtin(Builtin::Voice(voice))) => Some(*voice),
                    Some(Value::Number(_)) | None => None,
                    Some(other) => {
                        return Err(format!(
                            "PolySynth() expects a voice type such as tone.Synth, got {}",
                            other.type_name()
                        ))
                    }
                };
                if voice.is_some() {
                    positional.remove(0);
                }
                let voice = voice.unwrap_or(VoiceCtor::Synth);
                let mut options = Options::new("PolySynth", &["max_polyphony"], positional, named)?;
                let polyphony = options.number("max_polyphony", DEFAULT_POLYPHONY as f32)?;
                if !(1.0..=MAX_POLYPHONY as f32).contains(&polyphony) {
                    return Err(format!(
                        "max_polyphony must be between 1 and {}",
                        MAX_POLYPHONY
                    ));
                }
                let params = voice_params(voice, &mut options)?;
                options.finish()?;
                self.instrument(ToneSynth::poly(params, polyphony as usize))
            }
            Builtin::Reverb => {
                let mut options = Options::new("Reverb", &["decay"], positional, named)?;
                let decay = options.number("decay", 1.5)?;
                let wet = options.number("wet", 1.0)?;
                options.finish()?;
                if decay <= 0.0 {
                    return Err("Reverb decay must be positive".to_string());
                }
                Ok(effect(Effect::Reverb(Reverb::new(decay, wet))))
            }
            Builtin::FeedbackDelay => {
                let mut options = Options::new(
                    "FeedbackDelay",
                    &["delay_time", "feedback"],
                    positional,
                    named,
                )?;
                let delay_time = options.number("delay_time", 0.25)?;
                let feedback = options.number("feedback", 0.5)?;
                let wet = options.number("wet", 0.5)?;
                options.finish()?;
                Ok(effect(Effect::FeedbackDelay(FeedbackDelay::new(
                    delay_time, feedback, wet,
                ))))
            }
            Builtin::Filter => {
                let mut options =
                    Options::new("Filter", &["frequency", "type"], positional, named)?;
                let frequency = options.number("frequency", 350.0)?;
                let type_name = options.text("type", "lowpass")?;
                let q = options.number("q", 1.0)?;
                options.finish()?;
                let filter_type = FilterType::from_name(&type_name)
                    .ok_or_else(|| format!("unknown filter type \"{}\"", type_name))?;
                Ok(effect(Effect::Filter(Filter::new(filter_type, frequency, q))))
            }
            Builtin::Distortion => {
                let mut options = Options::new("Distortion", &["distortion"], positional, named)?;
                let amount = options.number("distortion", 0.4)?;
                let wet = options.number("wet", 1.0)?;
                options.finish()?;
                Ok(effect(Effect::Distortion(Distortion::new(amount, wet))))
            }
            Builtin::Volume => {
                let mut options = Options::new("Volume", &["volume"], positional, named)?;
                let volume = options.number("volume", 0.0)?;
                options.finish()?;
                Ok(effect(Effect::Volume(volume)))
            }
        }
    }

    fn instrument(&mut self, synth: ToneSynth) -> Result<Value, String> {
        if self.instruments >= MAX_INSTRUMENTS {
            return Err(format!("too many synths (limit {})", MAX_INSTRUMENTS));
        }
        self.instruments += 1;
        debug!(
            "Created {} with {} voice(s)",
            synth.params().kind.name(),
            synth.polyphony()
        );
        Ok(Value::Synth(SynthHandle::new(Box::new(synth))))
    }
}

fn effect(effect: Effect) -> Value {
    debug!("Created {}", effect.name());
    Value::Effect(EffectHandle::new(effect))
}

fn member(target: Value, name: &str) -> Result<Value, String> {
    match target {
        Value::Namespace => Builtin::from_name(name)
            .map(Value::Builtin)
            .ok_or_else(|| format!("the audio namespace has no member `{}`", name)),
        Value::Synth(_) | Value::Effect(_) => {
            let method = match name {
                "connect" => Method::Connect,
                "to_destination" | "toDestination" => Method::ToDestination,
                _ => {
                    return Err(format!(
                        "{} has no member `{}`",
                        target.type_name(),
                        name
                    ))
                }
            };
            Ok(Value::Method(Box::new(target), method))
        }
        other => Err(format!("cannot read `{}` of {}", name, other.type_name())),
    }
}

fn call_method(target: Value, method: Method, args: Vec<Value>) -> Result<Value, String> {
    match (method, args.as_slice()) {
        (Method::Connect, [destination]) => connect(&target, destination)?,
        (Method::Connect, _) => return Err("connect() needs one destination".to_string()),
        (Method::ToDestination, []) => connect(&target, &Value::Output)?,
        (Method::ToDestination, _) => {
            return Err("to_destination() takes no arguments".to_string())
        }
    }
    Ok(target)
}

fn connect(source: &Value, destination: &Value) -> Result<(), String> {
    let link = match destination {
        Value::Output => Link::Output,
        Value::Effect(effect) => Link::Effect(effect.clone()),
        other => return Err(format!("cannot connect into {}", other.type_name())),
    };

    match source {
        Value::Synth(synth) => {
            synth.connect(link);
            Ok(())
        }
        Value::Effect(effect) => {
            if reaches(&link, effect) {
                return Err(format!(
                    "connecting {} there would create a feedback loop",
                    effect.name()
                ));
            }
            effect.connect(link);
            Ok(())
        }
        other => Err(format!("cannot connect {}", other.type_name())),
    }
}

fn voice_params(voice: VoiceCtor, options: &mut Options) -> Result<VoiceParams, String> {
    let kind = match voice {
        VoiceCtor::Synth => VoiceKind::Basic,
        VoiceCtor::MonoSynth => VoiceKind::Mono,
        VoiceCtor::FmSynth => VoiceKind::Fm {
            harmonicity: options.ranged("harmonicity", 3.0, 0.0, 20.0)?,
            modulation_index: options.ranged("modulation_index", 10.0, 0.0, 100.0)?,
        },
        VoiceCtor::AmSynth => VoiceKind::Am {
            harmonicity: options.ranged("harmonicity", 3.0, 0.0, 20.0)?,
        },
        VoiceCtor::MembraneSynth => VoiceKind::Membrane {
            pitch_decay: options.ranged("pitch_decay", 0.05, 0.0, 10.0)?,
            octaves: options.ranged("octaves", 10.0, 0.0, 10.0)?,
        },
    };

    let mut params = VoiceParams::new(kind);
    if let Some(name) = options.optional_text("oscillator")? {
        params.waveform = Waveform::from_name(&name)
            .ok_or_else(|| format!("unknown oscillator type \"{}\"", name))?;
    }
    let envelope = params.envelope;
    params.envelope.attack = non_negative("attack", options.number("attack", envelope.attack)?)?;
    params.envelope.decay = non_negative("decay", options.number("decay", envelope.decay)?)?;
    params.envelope.sustain = options.number("sustain", envelope.sustain)?.clamp(0.0, 1.0);
    params.envelope.release =
        non_negative("release", options.number("release", envelope.release)?)?;
    params.detune = options.ranged("detune", 0.0, -2400.0, 2400.0)?;
    params.volume = options.ranged("volume", 0.0, -200.0, 24.0)?;
    Ok(params)
}

fn non_negative(name: &str, value: f32) -> Result<f32, String> {
    if value < 0.0 {
        Err(format!("{} must not be negative", name))
    } else {
        Ok(value)
    }
}

/// Constructor arguments, consumed by name.
struct Options {
    ctor: &'static str,
    values: Vec<(String, Value)>,
}

impl Options {
    /// Positional arguments are named after `positional_names`, in order.
    fn new(
        ctor: &'static str,
        positional_names: &[&str],
        positional: Vec<Value>,
        named: Vec<(String, Value)>,
    ) -> Result<Self, String> {
        if positional.len() > positional_names.len() {
            return Err(format!(
                "{}() takes at most {} positional argument(s)",
                ctor,
                positional_names.len()
            ));
        }

        let mut values: Vec<(String, Value)> = positional_names
            .iter()
            .map(|name| name.to_string())
            .zip(positional)
            .collect();
        for (name, value) in named {
            if values.iter().any(|(n, _)| *n == name) {
                return Err(format!("{}() got `{}` twice", ctor, name));
            }
            values.push((name, value));
        }
        Ok(Self { ctor, values })
    }

    fn take(&mut self, name: &str) -> Option<Value> {
        let index = self.values.iter().position(|(n, _)| n == name)?;
        Some(self.values.remove(index).1)
    }

    fn number(&mut self, name: &str, default: f32) -> Result<f32, String> {
        match self.take(name) {
            None => Ok(default),
            Some(Value::Number(n)) if (n as f32).is_finite() => Ok(n as f32),
            Some(Value::Number(_)) => Err(format!(
                "{} option `{}` is out of range",
                self.ctor, name
            )),
            Some(other) => Err(format!(
                "{} option `{}` must be a number, got {}",
                self.ctor,
                name,
                other.type_name()
            )),
        }
    }

    /// A number that must lie within `min..=max`.
    fn ranged(&mut self, name: &str, default: f32, min: f32, max: f32) -> Result<f32, String> {
        let value = self.number(name, default)?;
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(format!(
                "{} option `{}` must be between {} and {}, got {}",
                self.ctor, name, min, max, value
            ))
        }
    }

    fn optional_text(&mut self, name: &str) -> Result<Option<String>, String> {
        match self.take(name) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(other) => Err(format!(
                "{} option `{}` must be a string, got {}",
                self.ctor,
                name,
                other.type_name()
            )),
        }
    }

    fn text(&mut self, name: &str, default: &str) -> Result<String, String> {
        Ok(self
            .optional_text(name)?
            .unwrap_or_else(|| default.to_string()))
    }

    /// Fails on any option nobody asked for.
    fn finish(self) -> Result<(), String> {
        match self.values.first() {
            None => Ok(()),
            Some((name, _)) => {
                debug!("Rejecting unknown option {} for {}", name, self.ctor);
                Err(format!("unknown option `{}` for {}", name, self.ctor))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OutputNode;
    use crate::keymap::{Note, PitchClass};
    use crate::settings::DEFAULT_CODE;

    fn script_error(source: &str) -> String {
        match evaluate_source(source) {
            Err(EvalError::Script(message)) => message,
            Err(other) => panic!("expected a script error, got {:?}", other),
            Ok(set) => panic!("expected a script error, got {} synths", set.len()),
        }
    }

    fn rendered_peak(set: &SynthSet) -> f32 {
        let output = OutputNode::default();
        output.install(set.clone());
        let mut buffer = vec![0.0; 4096];
        output.render(&mut buffer, 1, 48_000.0);
        buffer.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()))
    }

    #[test]
    fn test_default_code_builds_one_routed_synth() {
        let set = evaluate_source(DEFAULT_CODE).expect("default code evaluates");
        assert_eq!(set.len(), 1);
        assert!(matches!(
            set.handles()[0].route(),
            Some(Link::Effect(ref e)) if e.name() == "Reverb"
        ));

        set.trigger_attack(Note::new(PitchClass::A, 4));
        assert!(rendered_peak(&set) > 0.0);
    }

    #[tokio::test]
    async fn test_async_evaluate() {
        let set = evaluate(DEFAULT_CODE.to_string()).await.unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_missing_factory() {
        let source = "fn make_synth(tone, out) { return tone.Synth() }";
        assert_eq!(evaluate_source(source).unwrap_err(), EvalError::MissingFactory);
        assert_eq!(evaluate_source("").unwrap_err(), EvalError::MissingFactory);
        assert_eq!(
            EvalError::MissingFactory.to_string(),
            "create_synth() was not found"
        );
    }

    #[test]
    fn test_empty_result() {
        for source in [
            "fn create_synth(tone, out) { tone.Synth() }",
            "fn create_synth(tone, out) { return }",
            "fn create_synth(tone, out) { return [] }",
        ] {
            assert_eq!(
                evaluate_source(source).unwrap_err(),
                EvalError::EmptyResult,
                "{}",
                source
            );
        }
    }

    #[test]
    fn test_single_and_list_results_normalize() {
        let single = "fn create_synth(t, out) { return t.Synth().to_destination() }";
        assert_eq!(evaluate_source(single).unwrap().len(), 1);

        let list = r#"
            fn create_synth(t, out) {
                let a = t.Synth()
                let b = t.FMSynth(harmonicity: 2)
                t.connect(a, out)
                t.connect(b, out)
                return [a, b]
            }
        "#;
        assert_eq!(evaluate_source(list).unwrap().len(), 2);

        let several = "fn create_synth(t, out) { return t.Synth(), t.AMSynth() }";
        assert_eq!(evaluate_source(several).unwrap().len(), 2);
    }

    #[test]
    fn test_helpers_and_effect_chains() {
        let source = r#"
            fn pad(t) {
                return t.PolySynth(t.AMSynth, oscillator: "sawtooth", release: 2, max_polyphony: 8)
            }

            fn create_synth(t, out) {
                let synth = pad(t)
                let filter = t.Filter(800, "lowpass", q: 2)
                let delay = t.FeedbackDelay(delay_time: 0.2, feedback: 0.3)
                t.connect_series(synth, filter, delay, t.Distortion(0.2), t.Volume(-3), out)
                return synth
            }
        "#;
        let set = evaluate_source(source).unwrap();
        set.trigger_attack(Note::new(PitchClass::C, 3));
        assert!(rendered_peak(&set) > 0.0);
    }

    #[test]
    fn test_unrouted_synth_is_silent() {
        let set = evaluate_source("fn create_synth(t, out) { return t.Synth() }").unwrap();
        set.trigger_attack(Note::new(PitchClass::C, 4));
        assert_eq!(rendered_peak(&set), 0.0);
    }

    #[test]
    fn test_syntax_errors_are_script_errors() {
        let message = script_error("fn create_synth(t, out) {\n  return t.Synth(\n}");
        assert!(message.starts_with("syntax error at 3:1"), "{}", message);
    }

    #[test]
    fn test_runtime_errors() {
        let message = script_error("fn create_synth(t, out) { return synth }");
        assert_eq!(message, "`synth` is not defined");

        let message = script_error("fn create_synth(t, out) { return t.Piano() }");
        assert!(message.contains("no member `Piano`"), "{}", message);

        let message = script_error("fn create_synth(t, out) { return t.Synth(wobble: 1) }");
        assert_eq!(message, "unknown option `wobble` for Synth");

        let message = script_error(r#"fn create_synth(t, out) { return t.Synth(oscillator: "pulse") }"#);
        assert!(message.contains("unknown oscillator"), "{}", message);

        let message = script_error(r#"fn create_synth(t, out) { return t.Synth(attack: "slow") }"#);
        assert!(message.contains("must be a number"), "{}", message);

        let message = script_error("fn create_synth(t, out) { return t.Reverb(2) }");
        assert!(message.contains("must return synths"), "{}", message);

        let message = script_error("fn create_synth(t, out) { return 4(2) }");
        assert!(message.contains("not callable"), "{}", message);
    }

    #[test]
    fn test_connection_rules() {
        let message = script_error(
            "fn create_synth(t, out) { let s = t.Synth()\n t.connect(out, s)\n return s }",
        );
        assert!(message.contains("cannot connect"), "{}", message);

        let message = script_error(
            r#"fn create_synth(t, out) {
                let a = t.Volume(0)
                let b = t.Volume(0)
                t.connect_series(a, b, a)
                return t.Synth()
            }"#,
        );
        assert!(message.contains("feedback loop"), "{}", message);
    }

    #[test]
    fn test_factory_may_take_fewer_parameters() {
        let message = script_error("fn create_synth() { return tone.Synth() }");
        assert_eq!(message, "`tone` is not defined");

        let source = "fn create_synth(t) { return t.MembraneSynth(octaves: 4).to_destination() }";
        assert_eq!(evaluate_source(source).unwrap().len(), 1);
    }

    #[test]
    fn test_recursion_is_bounded() {
        let message = script_error("fn f(t) { return f(t) }\nfn create_synth(t, out) { return f(t) }");
        assert!(message.contains("too many nested calls"), "{}", message);
    }

    #[test]
    fn test_deep_nesting_is_an_error() {
        let depth = 10_000;
        let source = format!(
            "fn create_synth(t, out) {{ return {}t.Synth(){} }}",
            "[".repeat(depth),
            "]".repeat(depth)
        );
        let message = script_error(&source);
        assert!(message.starts_with("syntax error at 1:"), "{}", message);
        assert!(message.ends_with("expression nested too deeply"), "{}", message);
    }

    #[test]
    fn test_expression_depth_is_bounded_across_calls() {
        // each call nests four lists deeper, well under the call limit
        let message = script_error(
            "fn f(t) { return [[[[f(t)]]]] }\nfn create_synth(t, out) { return f(t) }",
        );
        assert_eq!(message, "expression nested too deeply");
    }

    #[tokio::test]
    async fn test_deep_nesting_on_the_blocking_pool() {
        let source = format!(
            "fn create_synth(t, out) {{ return {}t.Synth(){} }}",
            "f(".repeat(20_000),
            ")".repeat(20_000)
        );
        assert!(matches!(evaluate(source).await, Err(EvalError::Script(_))));
    }

    #[test]
    fn test_voice_options_are_range_checked() {
        let err = script_error(
            "fn create_synth(t) { return t.MembraneSynth(octaves: 200).to_destination() }",
        );
        assert!(
            err.contains("MembraneSynth option `octaves` must be between 0 and 10"),
            "{}",
            err
        );
        let huge = format!("volume: 1{}", "0".repeat(300));
        for options in [
            "harmonicity: 1000000",
            "modulation_index: -1",
            "detune: 1000000",
            "volume: 400",
            huge.as_str(),
        ] {
            let source = format!(
                "fn create_synth(t) {{ return t.FMSynth({}).to_destination() }}",
                options
            );
            assert!(evaluate_source(&source).is_err(), "{} was accepted", options);
        }
    }

    #[test]
    fn test_extreme_voice_options_stay_finite() {
        let source = r#"
            fn create_synth(t) {
                let fm = t.FMSynth(harmonicity: 20, modulation_index: 100, detune: 2400, volume: 24)
                let drum = t.MembraneSynth(octaves: 10, pitch_decay: 10)
                return [fm.to_destination(), drum.to_destination()]
            }
        "#;
        let set = evaluate_source(source).unwrap();
        set.trigger_attack(Note::new(PitchClass::B, 8));
        let output = OutputNode::default();
        output.install(set);
        let mut buffer = vec![0.0; 4096];
        output.render(&mut buffer, 1, 48_000.0);
        assert!(buffer.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
    }

    #[test]
    fn test_instrument_limit() {
        let synths = vec!["t.Synth()"; MAX_INSTRUMENTS + 1].join(", ");
        let source = format!("fn create_synth(t, out) {{ return [{}] }}", synths);
        let message = script_error(&source);
        assert!(message.contains("too many synths"), "{}", message);
    }

    #[test]
    fn test_polyphony_bounds() {
        let message = script_error("fn create_synth(t, out) { return t.PolySynth(max_polyphony: 500) }");
        assert!(message.contains("max_polyphony"), "{}", message);

        let message = script_error(r#"fn create_synth(t, out) { return t.PolySynth("synth") }"#);
        assert!(message.contains("voice type"), "{}", message);
    }
}
