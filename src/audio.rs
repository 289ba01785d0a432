use std::sync::Arc;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    StreamConfig,
};
use crate::graph::OutputNode;
use tracing::{error, info};

/// Plays the output node on the default device until the runtime shuts down.
pub async fn run_audio_output(output: Arc<OutputNode>) {
    let result = tokio::task::spawn_blocking(move || {
        let host = cpal::default_host();
        let device = match host.default_output_device() {
            Some(device) => {
                info!("Default output device found: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));
                device
            },
            None => {
                error!("No output device found");
                return;
            }
        };

        let supported_config = match device.default_output_config() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to get default output config: {}", e);
                return;
            }
        };

        let config = StreamConfig {
            channels: supported_config.channels(),
            sample_rate: supported_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = config.channels as usize;
        let sample_rate = config.sample_rate.0 as f32;

        info!("Audio stream configuration: {:?} ({:?} device format)", config, supported_config.sample_format());

        let stream = match device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                output.render(data, channels, sample_rate);
            },
            |err| {
                error!("An error occurred on the audio stream: {}", err);
            },
            None,
        ) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to build audio stream: {}", e);
                return;
            }
        };

        info!("Starting audio stream...");
        if let Err(e) = stream.play() {
            error!("Failed to play audio stream: {}", e);
            return;
        }

        // the stream stops when dropped
        loop {
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
    })
    .await;

    if let Err(e) = result {
        error!("Audio task failed: {}", e);
    }
}
