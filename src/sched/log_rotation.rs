// Copyright the vpn-broker contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Daily log rotation.
//!
//! Archives the per-level logs under `<log_dir>/current/` into one
//! gzipped tar per day, `logs_YYYY-MM-DD.tar.gz` under
//! `<log_dir>/archive/`, truncates the live files, prunes archives older
//! than the keep window, and tells admins where the archive landed.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use time::ext::NumericalDuration;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::config::Settings;
use crate::error::Error;
use crate::notify::{AdminNotice, NotificationBus};
use crate::sched::{spawn_daily, Shutdown, TaskHandle};

const DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// The archive file name for one day's logs.
pub fn archive_name(date: Date) -> String {
    let formatted = date.format(DATE_FORMAT).expect("date formats infallibly");
    format!("logs_{formatted}.tar.gz")
}

/// Parses the date out of an archive file name, for pruning.
pub fn parse_archive_date(name: &str) -> Option<Date> {
    let date = name.strip_prefix("logs_")?.strip_suffix(".tar.gz")?;
    Date::parse(date, DATE_FORMAT).ok()
}

#[derive(Clone)]
pub struct LogRotator {
    settings: Arc<Settings>,
    bus: NotificationBus,
}

impl LogRotator {
    pub fn new(settings: Arc<Settings>, bus: NotificationBus) -> LogRotator {
        LogRotator { settings, bus }
    }

    fn current_dir(&self) -> PathBuf {
        self.settings.log_dir.join("current")
    }

    fn archive_dir(&self) -> PathBuf {
        self.settings.log_dir.join("archive")
    }

    pub fn spawn(self, shutdown: Shutdown) -> TaskHandle {
        let at = self.settings.log_rotation_time;
        let offset = self.settings.local_offset;
        spawn_daily("log_rotation", at, offset, shutdown, move || {
            let rotator = self.clone();
            async move { rotator.rotate().await }
        })
    }

    /// Runs one rotation: archive, truncate, prune, notify.
    pub async fn rotate(&self) -> Result<(), Error> {
        let local_now = OffsetDateTime::now_utc().to_offset(self.settings.local_offset);
        // The rotation runs just past midnight; the archive carries the
        // day the logs were written on.
        let archive_date = local_now.date() - 1.days();
        let keep_days = self.settings.log_keep_days;

        let rotator = self.clone();
        let archived = tokio::task::spawn_blocking(move || {
            let path = rotator.rotate_blocking(archive_date)?;
            rotator.prune_blocking(archive_date, keep_days)?;
            Ok::<_, Error>(path)
        })
        .await
        .map_err(|e| Error::Internal(format!("log rotation task panicked: {e}")))??;

        if let Some(path) = archived {
            tracing::info!(archive = %path.display(), "logs rotated");
            self.bus.notify_admins(AdminNotice::LogArchiveReady {
                date: archive_date,
                path,
            });
        }
        Ok(())
    }

    /// Archives and truncates the current logs. Returns the archive path,
    /// or `None` when there was nothing to rotate.
    fn rotate_blocking(&self, date: Date) -> Result<Option<PathBuf>, Error> {
        let current = self.current_dir();
        if !current.is_dir() {
            return Ok(None);
        }
        let logs: Vec<PathBuf> = fs::read_dir(&current)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "log")
                    && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
            })
            .collect();
        if logs.is_empty() {
            return Ok(None);
        }

        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir)?;
        let archive_path = archive_dir.join(archive_name(date));

        let file = File::create(&archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for log in &logs {
            let name = log
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::Internal(format!("unreadable log name: {log:?}")))?;
            builder.append_path_with_name(log, name)?;
        }
        builder.into_inner()?.finish()?;

        // Truncate rather than remove: the tracing appenders keep their
        // file handles open.
        for log in &logs {
            OpenOptions::new().write(true).truncate(true).open(log)?;
        }
        Ok(Some(archive_path))
    }

    /// Removes archives older than `keep_days` before `today`.
    fn prune_blocking(&self, today: Date, keep_days: u32) -> Result<(), Error> {
        let archive_dir = self.archive_dir();
        if !archive_dir.is_dir() {
            return Ok(());
        }
        let cutoff = today - i64::from(keep_days).days();
        for entry in fs::read_dir(&archive_dir)? {
            let path = entry?.path();
            let Some(date) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_archive_date)
            else {
                continue;
            };
            if date < cutoff {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to prune archive");
                } else {
                    tracing::debug!(path = %path.display(), "old log archive pruned");
                }
            }
        }
        Ok(())
    }
}

/// Creates the `current/` and `archive/` directories under `log_dir`.
pub fn prepare_log_dirs(log_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(log_dir.join("current"))?;
    fs::create_dir_all(log_dir.join("archive"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use time::macros::date;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn archive_names_round_trip() {
        let date = date!(2026 - 07 - 31);
        let name = archive_name(date);
        assert_eq!(name, "logs_2026-07-31.tar.gz");
        assert_eq!(parse_archive_date(&name), Some(date));
        assert_eq!(parse_archive_date("logs_garbage.tar.gz"), None);
        assert_eq!(parse_archive_date("other.txt"), None);
    }

    fn rotator_in(dir: &Path) -> LogRotator {
        let mut settings = Settings::with_trial_squad(Uuid::nil());
        settings.log_dir = dir.to_path_buf();
        let (bus, _receivers) = NotificationBus::new();
        LogRotator::new(Arc::new(settings), bus)
    }

    #[test]
    fn rotation_archives_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        prepare_log_dirs(dir.path()).unwrap();
        let info = dir.path().join("current/info.log");
        let mut f = File::create(&info).unwrap();
        writeln!(f, "a line worth keeping").unwrap();
        drop(f);

        let rotator = rotator_in(dir.path());
        let date = date!(2026 - 07 - 31);
        let archived = rotator.rotate_blocking(date).unwrap().unwrap();
        assert!(archived.ends_with("archive/logs_2026-07-31.tar.gz"));
        assert!(archived.is_file());
        assert_eq!(fs::metadata(&info).unwrap().len(), 0);

        // Nothing left to rotate on the second pass.
        assert!(rotator.rotate_blocking(date).unwrap().is_none());
    }

    #[test]
    fn pruning_removes_only_expired_archives() {
        let dir = tempfile::tempdir().unwrap();
        prepare_log_dirs(dir.path()).unwrap();
        let archive = dir.path().join("archive");
        File::create(archive.join("logs_2026-07-01.tar.gz")).unwrap();
        File::create(archive.join("logs_2026-07-30.tar.gz")).unwrap();
        File::create(archive.join("unrelated.txt")).unwrap();

        let rotator = rotator_in(dir.path());
        rotator.prune_blocking(date!(2026 - 07 - 31), 14).unwrap();

        assert!(!archive.join("logs_2026-07-01.tar.gz").exists());
        assert!(archive.join("logs_2026-07-30.tar.gz").exists());
        assert!(archive.join("unrelated.txt").exists());
    }
}
