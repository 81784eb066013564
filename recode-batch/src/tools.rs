//! External tool integration
//!
//! The pipeline talks to three subprocess-backed tools: a probe that
//! characterizes source files, encoders that produce the converted output,
//! and a comparator that validates quality. Each is behind a trait so the
//! pipeline and its tests can substitute in-process fakes.

use crate::types::{ConversionParams, MediaFeatures};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Subprocess tool failures
#[derive(Debug, Error)]
pub enum ToolError {
    /// The configured binary is not installed or not on PATH
    #[error("{tool} binary not found: {bin}")]
    MissingBinary { tool: &'static str, bin: String },

    /// The tool ran but exited with a failure status
    #[error("{tool} failed (exit {status}): {stderr}")]
    Failed {
        tool: &'static str,
        status: i32,
        stderr: String,
    },

    /// The tool exceeded the per-task deadline and was killed
    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout {
        tool: &'static str,
        timeout_secs: u64,
    },

    /// The batch was cancelled while the tool was running
    #[error("cancelled")]
    Cancelled,

    /// The tool produced output the parser could not use
    #[error("unusable {tool} output: {detail}")]
    InvalidOutput { tool: &'static str, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of one conversion run
#[derive(Debug, Clone, Copy)]
pub struct ConvertOutcome {
    pub output_size: i64,
    pub elapsed_ms: i64,
}

/// Result of one quality comparison
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub method: String,
    pub passed: bool,
    /// Fraction of pixels that differ; 0 means bit-exact pixels
    pub pixel_diff_percent: f64,
    pub psnr: f64,
    pub ssim: f64,
}

/// Probes one file and reports its media characteristics
#[async_trait]
pub trait Characterizer: Send + Sync {
    async fn characterize(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaFeatures, ToolError>;
}

/// Converts one file with the given parameters
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        params: &ConversionParams,
        cancel: &CancellationToken,
    ) -> Result<ConvertOutcome, ToolError>;
}

/// Compares the converted output against the original
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        original: &Path,
        converted: &Path,
        lossless: bool,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome, ToolError>;
}

/// Run a prepared command with a deadline and cancellation
///
/// The child is killed when the deadline passes or the token fires;
/// `kill_on_drop` covers both paths.
async fn run_tool(
    tool: &'static str,
    mut cmd: Command,
    bin: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<std::process::Output, ToolError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::MissingBinary {
                tool,
                bin: bin.to_string(),
            }
        } else {
            ToolError::Io(e)
        }
    })?;

    let waited = tokio::time::timeout(timeout, async {
        tokio::select! {
            _ = cancel.cancelled() => None,
            output = child.wait_with_output() => Some(output),
        }
    })
    .await;

    match waited {
        Err(_) => Err(ToolError::Timeout {
            tool,
            timeout_secs: timeout.as_secs(),
        }),
        Ok(None) => Err(ToolError::Cancelled),
        Ok(Some(Err(e))) => Err(ToolError::Io(e)),
        Ok(Some(Ok(output))) => Ok(output),
    }
}

fn failure(tool: &'static str, output: &std::process::Output) -> ToolError {
    ToolError::Failed {
        tool,
        status: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// ffprobe-backed characterizer
pub struct ProbeCharacterizer {
    bin: String,
    timeout: Duration,
}

impl ProbeCharacterizer {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Characterizer for ProbeCharacterizer {
    async fn characterize(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaFeatures, ToolError> {
        const TOOL: &str = "probe";

        let file_size = tokio::fs::metadata(path).await?.len() as i64;

        let mut cmd = Command::new(&self.bin);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path);

        let output = run_tool(TOOL, cmd, &self.bin, self.timeout, cancel).await?;
        if !output.status.success() {
            return Err(failure(TOOL, &output));
        }

        let probe: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| ToolError::InvalidOutput {
                tool: TOOL,
                detail: e.to_string(),
            })?;

        let stream = probe
            .get("streams")
            .and_then(|s| s.as_array())
            .and_then(|streams| {
                streams.iter().find(|s| {
                    s.get("codec_type").and_then(|t| t.as_str()) == Some("video")
                })
            })
            .ok_or_else(|| ToolError::InvalidOutput {
                tool: TOOL,
                detail: format!("no video stream in {}", path.display()),
            })?;

        let codec = stream
            .get("codec_name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        // mjpeg means a plain JPEG when probing a still image
        let format = match codec.as_str() {
            "mjpeg" => "jpeg".to_string(),
            "" => extension_of(path),
            other => other.to_string(),
        };

        let frame_count = stream
            .get("nb_frames")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(1);
        let pix_fmt = stream
            .get("pix_fmt")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        Ok(MediaFeatures {
            path: path.to_path_buf(),
            format,
            file_size,
            width: stream.get("width").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            height: stream.get("height").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            has_alpha: pix_fmt.contains('a'),
            pix_fmt,
            is_animated: frame_count > 1,
            frame_count,
            estimated_quality: 0,
        })
    }
}

/// Encoder front-end dispatching to cjxl or avifenc by target format
pub struct CommandConverter {
    jxl_bin: String,
    avif_bin: String,
    timeout: Duration,
}

impl CommandConverter {
    pub fn new(jxl_bin: impl Into<String>, avif_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            jxl_bin: jxl_bin.into(),
            avif_bin: avif_bin.into(),
            timeout,
        }
    }

    fn build_command(&self, input: &Path, output: &Path, params: &ConversionParams) -> (Command, &str) {
        match params.target_format.as_str() {
            "avif" => {
                let mut cmd = Command::new(&self.avif_bin);
                cmd.arg("--min")
                    .arg(params.crf.to_string())
                    .arg("--max")
                    .arg(params.crf.to_string())
                    .arg("--speed")
                    .arg(params.speed.to_string())
                    .arg(input)
                    .arg(output);
                (cmd, self.avif_bin.as_str())
            }
            _ => {
                let mut cmd = Command::new(&self.jxl_bin);
                cmd.arg("-d")
                    .arg(format!("{}", params.distance))
                    .arg("-e")
                    .arg(params.effort.to_string());
                if params.lossless_jpeg {
                    cmd.arg("--lossless_jpeg=1");
                }
                cmd.arg(input).arg(output);
                (cmd, self.jxl_bin.as_str())
            }
        }
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        params: &ConversionParams,
        cancel: &CancellationToken,
    ) -> Result<ConvertOutcome, ToolError> {
        const TOOL: &str = "converter";

        let (cmd, bin) = self.build_command(input, output, params);
        debug!(
            input = %input.display(),
            target = %params.target_format,
            "starting conversion"
        );

        let started = Instant::now();
        let result = run_tool(TOOL, cmd, bin, self.timeout, cancel).await?;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        if !result.status.success() {
            // a partial output file must not survive a failed encode
            let _ = tokio::fs::remove_file(output).await;
            return Err(failure(TOOL, &result));
        }

        let output_size = tokio::fs::metadata(output).await?.len() as i64;
        Ok(ConvertOutcome {
            output_size,
            elapsed_ms,
        })
    }
}

/// ImageMagick-backed quality validator
///
/// Runs `magick compare` three times (AE, PSNR, SSIM). compare exits 1 when
/// the images differ, which is a valid measurement, not a tool failure.
pub struct CompareValidator {
    bin: String,
    timeout: Duration,
}

impl CompareValidator {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    async fn metric(
        &self,
        metric: &str,
        a: &Path,
        b: &Path,
        cancel: &CancellationToken,
    ) -> Result<f64, ToolError> {
        const TOOL: &str = "validator";

        let mut cmd = Command::new(&self.bin);
        cmd.arg("compare")
            .arg("-metric")
            .arg(metric)
            .arg(a)
            .arg(b)
            .arg("null:");

        let output = run_tool(TOOL, cmd, &self.bin, self.timeout, cancel).await?;
        // exit 0 = identical, 1 = differ; anything else is a real failure
        match output.status.code() {
            Some(0) | Some(1) => {}
            _ => return Err(failure(TOOL, &output)),
        }

        // compare prints the metric value on stderr
        let text = String::from_utf8_lossy(&output.stderr);
        let value = text
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| ToolError::InvalidOutput {
                tool: TOOL,
                detail: format!("{} output: {:?}", metric, text.trim()),
            })?;
        Ok(value)
    }
}

#[async_trait]
impl Validator for CompareValidator {
    async fn validate(
        &self,
        original: &Path,
        converted: &Path,
        lossless: bool,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome, ToolError> {
        if lossless {
            let differing_pixels = self.metric("AE", original, converted, cancel).await?;
            let passed = differing_pixels == 0.0;
            if !passed {
                warn!(
                    original = %original.display(),
                    differing_pixels,
                    "lossless validation found pixel differences"
                );
            }
            return Ok(ValidationOutcome {
                method: "pixel_diff".to_string(),
                passed,
                pixel_diff_percent: if passed { 0.0 } else { 1.0 },
                psnr: if passed { f64::INFINITY } else { 0.0 },
                ssim: if passed { 1.0 } else { 0.0 },
            });
        }

        let psnr = self.metric("PSNR", original, converted, cancel).await?;
        let ssim = self.metric("SSIM", original, converted, cancel).await?;
        // Either metric clearing its bar is acceptable quality
        let passed = psnr > 40.0 || ssim > 0.95;
        Ok(ValidationOutcome {
            method: "psnr_ssim".to_string(),
            passed,
            pixel_diff_percent: 0.0,
            psnr,
            ssim,
        })
    }
}

/// Check that a tool binary exists and is executable
///
/// Most media tools exit nonzero on `--version` misuse but still prove they
/// are installed, so only a spawn failure counts as missing.
pub async fn binary_available(bin: &str) -> bool {
    match Command::new(bin)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(_) => true,
        Err(e) => {
            debug!(bin, error = %e, "binary availability check failed");
            false
        }
    }
}

/// Extensions the scanner considers convertible
const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heif", "heic", "mp4", "mov", "webm",
];

/// Recursively collect convertible files under `root`, sorted by path
///
/// Unreadable directories are logged and skipped so one bad mount never
/// aborts a scan.
pub fn scan_media_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| MEDIA_EXTENSIONS.contains(&extension_of(p).as_str()))
        .collect();
    files.sort();
    files
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_filters_and_sorts() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["b.png", "a.JPG", "notes.txt", "c.gif"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/d.webp"), b"x").unwrap();

        let files = scan_media_files(dir.path());
        let names: Vec<String> = files
            .iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png", "c.gif", "sub/d.webp"]);
    }

    #[test]
    fn jxl_command_carries_lossless_jpeg_flag() {
        let converter = CommandConverter::new("cjxl", "avifenc", Duration::from_secs(10));
        let params = ConversionParams::static_default("jpeg");
        let (cmd, bin) = converter.build_command(
            Path::new("in.jpg"),
            Path::new("out.jxl"),
            &params,
        );
        assert_eq!(bin, "cjxl");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--lossless_jpeg=1".to_string()));
        assert!(args.contains(&"-d".to_string()));
    }

    #[test]
    fn avif_command_uses_crf_and_speed() {
        let converter = CommandConverter::new("cjxl", "avifenc", Duration::from_secs(10));
        let params = ConversionParams::static_default("gif");
        let (cmd, bin) = converter.build_command(
            Path::new("in.gif"),
            Path::new("out.avif"),
            &params,
        );
        assert_eq!(bin, "avifenc");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"28".to_string()));
        assert!(args.contains(&"--speed".to_string()));
    }

    #[tokio::test]
    async fn cancellation_reaches_a_running_probe() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("photo.png");
        std::fs::write(&input, b"x").unwrap();

        // stand-in binary that would outlive the test if not killed
        let probe = ProbeCharacterizer::new("sleep", Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();

        let err = probe.characterize(&input, &token).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_reaches_a_running_compare() {
        let validator = CompareValidator::new("sleep", Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();

        let err = validator
            .validate(Path::new("a.png"), Path::new("b.png"), true, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_such() {
        let converter = CommandConverter::new(
            "definitely-not-a-real-encoder",
            "avifenc",
            Duration::from_secs(5),
        );
        let err = converter
            .convert(
                Path::new("in.png"),
                Path::new("out.jxl"),
                &ConversionParams::static_default("png"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MissingBinary { .. }));
    }
}
