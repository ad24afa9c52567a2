// ABOUTME: Persisted build log location and retrieval
// ABOUTME: Full dumps or follow mode that ends once the built image appears in the engine

use crate::engine::{split_image_ref, ContainerEngine, LogStream};
use crate::error::{Result, RunnerError};
use futures::stream;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Log file for an image ref; the tag is dropped so every build of a name shares one file
pub fn build_log_path(log_dir: &Path, image: &str) -> PathBuf {
    let (name, _) = split_image_ref(image);
    let file_name: String = name
        .chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .collect();
    log_dir.join(format!("{}.log", file_name))
}

pub struct BuildLogReader {
    engine: Arc<dyn ContainerEngine>,
    log_dir: PathBuf,
    poll_interval: Duration,
    grace_period: Duration,
}

impl BuildLogReader {
    pub fn new(engine: Arc<dyn ContainerEngine>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            log_dir: log_dir.into(),
            poll_interval: Duration::from_millis(500),
            grace_period: Duration::from_secs(1),
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, grace_period: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.grace_period = grace_period;
        self
    }

    /// Stream the build log of `image` line by line.
    ///
    /// In follow mode the stream keeps tailing until the image exists, then waits
    /// the grace period, drains what is left and ends. A line still being written
    /// is held back until its newline arrives or the final drain.
    pub async fn read(&self, image: &str, follow: bool) -> Result<LogStream> {
        let path = build_log_path(&self.log_dir, image);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RunnerError::not_found(format!("build logs for image {}", image))
            } else {
                RunnerError::Io(e)
            }
        })?;

        let mut reader = BufReader::new(file);

        if !follow {
            let mut lines = Vec::new();
            let mut line = String::new();
            while reader.read_line(&mut line).await? > 0 {
                lines.push(Ok(strip_newline(&line)));
                line.clear();
            }
            return Ok(Box::pin(stream::iter(lines)));
        }

        let engine = self.engine.clone();
        let image = image.to_string();
        let poll_interval = self.poll_interval;
        let grace_period = self.grace_period;

        let stream = async_stream::stream! {
            // Bytes of the line being written; only whole lines are emitted
            let mut pending = Vec::new();
            let mut draining = false;
            loop {
                match reader.read_until(b'\n', &mut pending).await {
                    Ok(0) if draining => {
                        if !pending.is_empty() {
                            yield Ok(decode_line(&pending));
                        }
                        break;
                    }
                    Ok(0) => match engine.image_exists(&image).await {
                        Ok(true) => {
                            tokio::time::sleep(grace_period).await;
                            draining = true;
                        }
                        Ok(false) => tokio::time::sleep(poll_interval).await,
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    },
                    Ok(_) if pending.ends_with(b"\n") => {
                        yield Ok(decode_line(&pending));
                        pending.clear();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(RunnerError::Io(e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn strip_newline(line: &str) -> String {
    line.trim_end_matches(['\n', '\r']).to_string()
}

fn decode_line(bytes: &[u8]) -> String {
    strip_newline(&String::from_utf8_lossy(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_drops_tag() {
        let dir = Path::new("/var/log/builds");
        assert_eq!(
            build_log_path(dir, "team/app:1.0"),
            PathBuf::from("/var/log/builds/team_app.log")
        );
        assert_eq!(
            build_log_path(dir, "registry:5000/app:2"),
            build_log_path(dir, "registry:5000/app:3")
        );
    }
}
