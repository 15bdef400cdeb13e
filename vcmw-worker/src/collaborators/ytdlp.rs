//! Media fetcher backed by the `yt-dlp` downloader
//!
//! Queries that are not URLs are resolved as a single-result search. The
//! audio lands at `<download_dir>/<destination>-<task id>.<ext>` so two
//! tasks never write the same file.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};
use vcmw_common::config::FetcherConfig;

use super::{FetchError, FetchRequest, FetchedMedia, MediaFetcher};

/// `yt-dlp` wrapper
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    config: FetcherConfig,
}

impl YtDlpFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }

    /// Whether the configured cookies file exists and will be passed along
    pub fn cookies_available(&self) -> bool {
        self.config.cookies_file.is_file()
    }

    pub fn download_dir(&self) -> &Path {
        &self.config.download_dir
    }

    fn output_template(&self, request: &FetchRequest) -> PathBuf {
        self.config
            .download_dir
            .join(format!("{}-{}.%(ext)s", request.destination, request.task_id))
    }

    pub(crate) fn build_args(&self, request: &FetchRequest) -> Vec<String> {
        let mut args = vec![
            "--format".to_string(),
            "bestaudio/best".to_string(),
            "--no-playlist".to_string(),
            "--geo-bypass".to_string(),
            "--no-check-certificates".to_string(),
            "--concurrent-fragments".to_string(),
            "5".to_string(),
            "--no-progress".to_string(),
            "--no-simulate".to_string(),
            "--output".to_string(),
            self.output_template(request).to_string_lossy().into_owned(),
            // One field per line, in this order
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "--print".to_string(),
            "after_move:title".to_string(),
            "--print".to_string(),
            "after_move:duration".to_string(),
        ];

        if self.cookies_available() {
            args.push("--cookies".to_string());
            args.push(self.config.cookies_file.to_string_lossy().into_owned());
        }

        args.push(search_target(&request.query));
        args
    }
}

/// URLs pass through; anything else becomes a one-result search
pub(crate) fn search_target(query: &str) -> String {
    let query = query.trim();
    if query.starts_with("http://") || query.starts_with("https://") {
        query.to_string()
    } else {
        format!("ytsearch1:{}", query)
    }
}

/// Parse the three `--print` lines: file path, title, duration in seconds
pub(crate) fn parse_output(stdout: &str) -> Option<(PathBuf, String, Option<Duration>)> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let path = PathBuf::from(lines.next()?);
    let title = lines.next()?.to_string();
    let duration = lines
        .next()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64);
    Some((path, title, duration))
}

impl MediaFetcher for YtDlpFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchedMedia, FetchError> {
        std::fs::create_dir_all(&self.config.download_dir)?;

        let args = self.build_args(request);
        debug!(task_id = %request.task_id, program = %self.config.program, ?args, "Running downloader");

        let output = Command::new(&self.config.program).args(&args).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output")
                .trim()
                .to_string();
            return Err(FetchError::Downloader(format!("{} ({})", reason, output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (path, title, duration) =
            parse_output(&stdout).ok_or_else(|| FetchError::NoResult(request.query.clone()))?;

        if !path.is_file() {
            return Err(FetchError::MissingFile(path));
        }

        info!(
            task_id = %request.task_id,
            title = %title,
            file = %path.display(),
            "Fetched media"
        );

        Ok(FetchedMedia {
            path,
            title,
            duration,
        })
    }
}
