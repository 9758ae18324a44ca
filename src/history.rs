//! Append-only run history.
//!
//! One [`RunRecord`] per line of JSON (`history.jsonl`). The store is the only
//! state shared between concurrent runs, so every append goes through an
//! async mutex and is written with a single `write_all` on an `O_APPEND`
//! handle, followed by `sync_data`. A record is therefore either fully on
//! disk or not at all, and two runs can never interleave their bytes.
//!
//! Lines that fail to parse (a tail torn by a crash, a hand edit) are skipped
//! with a warning rather than failing the whole query.

use crate::error::DocQrError;
use crate::output::{FinalStatus, RunRecord};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Query parameters for [`HistoryStore::list`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub status: Option<FinalStatus>,
    /// Case-insensitive substring of the input filename.
    pub filename_contains: Option<String>,
    /// Keep at most this many records (most recent first).
    pub limit: Option<usize>,
}

impl HistoryFilter {
    fn matches(&self, record: &RunRecord) -> bool {
        if self.status.is_some_and(|s| s != record.final_status) {
            return false;
        }
        match &self.filename_contains {
            Some(needle) => record
                .input_filename
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// JSON-lines history log.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl HistoryStore {
    /// Open (creating if needed) the log at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DocQrError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| DocQrError::HistoryIo {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await
            .map_err(io_err)?;

        // Terminate a torn last line so the next record starts cleanly.
        let len = file.metadata().await.map_err(io_err)?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(std::io::SeekFrom::End(-1)).await.map_err(io_err)?;
            file.read_exact(&mut last).await.map_err(io_err)?;
            if last[0] != b'\n' {
                warn!("History log {} has a torn last line", path.display());
                file.write_all(b"\n").await.map_err(io_err)?;
            }
        }
        debug!("History log opened: {}", path.display());

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record durably.
    pub async fn append(&self, record: &RunRecord) -> Result<(), DocQrError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let io_err = |source| DocQrError::HistoryIo {
            path: self.path.clone(),
            source,
        };
        file.write_all(&line).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        debug!("History: appended run {}", record.run_id);
        Ok(())
    }

    /// Records matching `filter`, most recent first.
    pub async fn list(&self, filter: &HistoryFilter) -> Result<Vec<RunRecord>, DocQrError> {
        let mut records: Vec<RunRecord> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// The record with this exact run id.
    pub async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>, DocQrError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|r| r.run_id == run_id))
    }

    /// Records whose run id starts with `prefix` (the short ids shown by the CLI).
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<RunRecord>, DocQrError> {
        let prefix = prefix.to_lowercase();
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.run_id.to_string().starts_with(&prefix))
            .collect())
    }

    async fn read_all(&self) -> Result<Vec<RunRecord>, DocQrError> {
        // Hold the append lock so a concurrent writer cannot be observed mid-line.
        let _guard = self.file.lock().await;
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DocQrError::HistoryIo {
                path: self.path.clone(),
                source,
            })?;
        Ok(parse_lines(&raw, &self.path))
    }
}

fn parse_lines(raw: &str, path: &Path) -> Vec<RunRecord> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| match serde_json::from_str::<RunRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("{}:{}: skipping unreadable record: {}", path.display(), n + 1, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{StageName, StageStatus};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn record(filename: &str, status: FinalStatus, minutes_ago: i64) -> RunRecord {
        let started = Utc::now() - ChronoDuration::minutes(minutes_ago);
        RunRecord {
            run_id: Uuid::new_v4(),
            input_filename: filename.into(),
            started_at: started,
            finished_at: started,
            stage_statuses: StageName::ALL
                .iter()
                .map(|s| StageStatus::skipped(*s, None))
                .collect(),
            final_status: status,
            output_pdf_ref: None,
            qr_image_ref: None,
            summary: None,
            email_sent: false,
        }
    }

    #[tokio::test]
    async fn append_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("h/history.jsonl")).await.unwrap();

        let old = record("contrato.docx", FinalStatus::Success, 10);
        let new = record("procuracao.docx", FinalStatus::Failed, 1);
        store.append(&old).await.unwrap();
        store.append(&new).await.unwrap();

        let all = store.list(&HistoryFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].run_id, new.run_id, "most recent first");

        let failed = store
            .list(&HistoryFilter {
                status: Some(FinalStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);

        let by_name = store
            .list(&HistoryFilter {
                filename_contains: Some("CONTRATO".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_name[0].run_id, old.run_id);

        assert_eq!(store.get(old.run_id).await.unwrap(), Some(old.clone()));
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());

        let short = &new.run_id.to_string()[..8];
        assert_eq!(store.find_by_prefix(short).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let r = record("a.docx", FinalStatus::Partial, 0);
        {
            let store = HistoryStore::open(&path).await.unwrap();
            store.append(&r).await.unwrap();
        }
        let store = HistoryStore::open(&path).await.unwrap();
        assert_eq!(store.get(r.run_id).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn torn_tail_is_skipped_and_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let good = record("a.docx", FinalStatus::Success, 5);
        let mut content = serde_json::to_string(&good).unwrap();
        content.push('\n');
        content.push_str("{\"run_id\": \"trunc");
        std::fs::write(&path, content).unwrap();

        let store = HistoryStore::open(&path).await.unwrap();
        let next = record("b.docx", FinalStatus::Success, 0);
        store.append(&next).await.unwrap();

        let all = store.list(&HistoryFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].run_id, next.run_id);
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::open(dir.path().join("history.jsonl")).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let r = record(&format!("doc{i}.docx"), FinalStatus::Success, 0);
                store.append(&r).await.unwrap();
                r.run_id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.lines().count(), 32);
        for line in raw.lines() {
            serde_json::from_str::<RunRecord>(line).expect("every line is a whole record");
        }
        for id in ids {
            assert!(store.get(id).await.unwrap().is_some());
        }
    }
}
