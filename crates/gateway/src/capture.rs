//! ffmpeg capture subprocess management.
//!
//! One pipeline per streaming run: spawned when the first viewer arrives,
//! torn down when the run ends. The child is created with `kill_on_drop` so
//! a panicked or aborted distributor task cannot leak an encoder process.

use std::process::Stdio;

use tokio::process::{Child, ChildStdout, Command};
use tracing::{info, warn};

pub const FFMPEG_BIN: &str = "ffmpeg";

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: String,
    pub resolution: String,
}

pub struct CapturePipeline {
    child: Child,
}

/// ffmpeg invocation producing a raw Annex B H.264 elementary stream on
/// stdout: B-frames disabled and zero muxing delay keep the glass-to-glass
/// latency down, and the bitstream filter guarantees start-code framing.
pub fn ffmpeg_args(settings: &CaptureSettings) -> Vec<String> {
    let (input_format, input) = if cfg!(windows) {
        ("dshow", format!("video={}", settings.device))
    } else {
        ("v4l2", settings.device.clone())
    };

    let mut args: Vec<String> = ["-rtbufsize", "100M", "-f", input_format, "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(input);
    args.extend(["-pix_fmt", "yuv420p", "-s"].iter().map(|s| s.to_string()));
    args.push(settings.resolution.clone());
    args.extend(
        [
            "-c:v",
            "libx264",
            "-bsf:v",
            "h264_mp4toannexb",
            "-b:v",
            "2M",
            "-max_delay",
            "0",
            "-bf",
            "0",
            "-f",
            "h264",
            "-",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args
}

impl CapturePipeline {
    pub fn spawn(settings: &CaptureSettings) -> std::io::Result<(Self, ChildStdout)> {
        Self::spawn_program(FFMPEG_BIN, settings)
    }

    fn spawn_program(
        program: &str,
        settings: &CaptureSettings,
    ) -> std::io::Result<(Self, ChildStdout)> {
        let mut cmd = Command::new(program);
        cmd.args(ffmpeg_args(settings))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn()?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return Err(std::io::Error::other("capture process stdout was not piped"));
        };

        info!(
            program,
            device = %settings.device,
            resolution = %settings.resolution,
            pid = child.id().unwrap_or(0),
            "capture process spawned"
        );
        Ok((Self { child }, stdout))
    }

    /// Kill the encoder and reap it. Always called when a run ends, whatever
    /// the reason; the pipe reader sees end-of-stream shortly after.
    pub async fn shutdown(mut self) {
        let _ = self.child.start_kill();
        match self.child.wait().await {
            Ok(status) => info!(%status, "capture process terminated"),
            Err(e) => warn!("error reaping capture process: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            device: "/dev/video0".to_string(),
            resolution: "640x360".to_string(),
        }
    }

    #[test]
    fn args_produce_elementary_stream_on_stdout() {
        let args = ffmpeg_args(&settings());
        assert_eq!(args.last().map(String::as_str), Some("-"));
        let f = args.iter().position(|a| a == "-f").unwrap();
        assert!(args.contains(&"h264_mp4toannexb".to_string()));
        assert!(args[f + 1] == "v4l2" || args[f + 1] == "dshow");
    }

    #[test]
    fn args_carry_device_and_resolution() {
        let args = ffmpeg_args(&settings());
        assert!(args.iter().any(|a| a.contains("/dev/video0")));
        let s = args.iter().position(|a| a == "-s").unwrap();
        assert_eq!(args[s + 1], "640x360");
        let b = args.iter().position(|a| a == "-bf").unwrap();
        assert_eq!(args[b + 1], "0");
    }

    #[tokio::test]
    async fn spawn_failure_reports_an_error() {
        let result = CapturePipeline::spawn_program("camgate-no-such-encoder", &settings());
        assert!(result.is_err());
    }
}
