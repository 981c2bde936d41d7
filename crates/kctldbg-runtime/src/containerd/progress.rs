//! Image-pull progress reporting.
//!
//! While a pull is active a 100 ms ticker joins the refs we have seen so
//! far with the content store's active-ingest statuses and renders a
//! tab-separated table onto the session stream: one resolution row for the
//! image plus one row per descriptor. The tracker itself is shared between
//! sessions so concurrent pulls of one image render consistently; it is the
//! only cross-session state in the agent.

use crate::SharedWriter;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::{GetImageRequest, InfoRequest, ListStatusesRequest};
use containerd_client::with_namespace;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Code, Request};
use tracing::error;

/// Tick period of the table renderer.
pub const RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// Refs seen per ongoing pull, shared by every containerd adapter instance.
#[derive(Debug, Default)]
pub struct PullTracker {
    refs: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl PullTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers a descriptor ref for an image pull.
    pub fn record(&self, image: &str, r#ref: &str) {
        if let Ok(mut refs) = self.refs.lock() {
            refs.entry(image.to_string())
                .or_default()
                .insert(r#ref.to_string());
        }
    }

    /// All refs seen for an image, in stable order.
    #[must_use]
    pub fn refs(&self, image: &str) -> Vec<String> {
        self.refs
            .lock()
            .map(|refs| {
                refs.get(image)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Forgets an image once its pull has finished.
    pub fn forget(&self, image: &str) {
        if let Ok(mut refs) = self.refs.lock() {
            refs.remove(image);
        }
    }
}

/// One row of the status table.
#[derive(Debug, Clone)]
pub struct StatusRow {
    /// Descriptor ref or image name.
    pub r#ref: String,
    /// resolving | resolved | waiting | downloading | done | exists | uploading.
    pub status: &'static str,
    /// Bytes ingested so far.
    pub offset: i64,
    /// Total bytes, when known.
    pub total: i64,
}

/// Renders the table until `cancel` fires, then renders one final tick.
pub async fn render_pull_progress(
    channel: Channel,
    namespace: &'static str,
    image: String,
    tracker: &PullTracker,
    out: SharedWriter,
    cancel: CancellationToken,
) {
    let start = Instant::now();
    let started_at = SystemTime::now();
    let mut images = ImagesClient::new(channel.clone());
    let mut content = ContentClient::new(channel);
    let mut interval = tokio::time::interval(RENDER_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut resolved = false;
    let mut done = false;

    loop {
        tokio::select! {
            () = cancel.cancelled(), if !done => {
                // One more tick so the final states land on screen.
                done = true;
            }
            _ = interval.tick() => {}
        }

        if !resolved {
            let req = GetImageRequest {
                name: image.clone(),
            };
            resolved = images.get(with_namespace!(req, namespace)).await.is_ok();
        }

        let mut rows = vec![StatusRow {
            r#ref: image.clone(),
            status: if resolved { "resolved" } else { "resolving" },
            offset: 0,
            total: 0,
        }];

        let mut active_seen = HashSet::new();
        if !done {
            let req = ListStatusesRequest { filters: vec![] };
            match content.list_statuses(with_namespace!(req, namespace)).await {
                Ok(resp) => {
                    for status in resp.into_inner().statuses {
                        tracker.record(&image, &status.r#ref);
                        active_seen.insert(status.r#ref.clone());
                        rows.push(StatusRow {
                            r#ref: status.r#ref,
                            status: "downloading",
                            offset: status.offset,
                            total: status.total,
                        });
                    }
                }
                Err(e) => {
                    error!("active ingest check failed: {e}");
                    continue;
                }
            }
        }

        for r#ref in tracker.refs(&image) {
            if active_seen.contains(&r#ref) {
                continue;
            }
            let status = if done {
                "done"
            } else {
                classify_inactive(&mut content, namespace, &r#ref, started_at).await
            };
            rows.push(StatusRow {
                r#ref,
                status,
                offset: 0,
                total: 0,
            });
        }

        let table = render_table(&rows, start.elapsed());
        if out.write_str(&table).await.is_err() {
            return;
        }

        if done {
            return;
        }
    }
}

/// Status of a known ref that is no longer actively ingesting.
async fn classify_inactive(
    content: &mut ContentClient<Channel>,
    namespace: &'static str,
    r#ref: &str,
    started_at: SystemTime,
) -> &'static str {
    // Refs look like "layer-sha256:..."; the digest follows the kind tag.
    let Some((_, digest)) = r#ref.split_once('-') else {
        return "waiting";
    };
    let req = InfoRequest {
        digest: digest.to_string(),
    };
    match content.info(with_namespace!(req, namespace)).await {
        Ok(resp) => {
            let created_after_start = resp
                .into_inner()
                .info
                .and_then(|i| i.created_at)
                .is_some_and(|ts| timestamp_after(&ts, started_at));
            if created_after_start {
                "done"
            } else {
                "exists"
            }
        }
        Err(status) if status.code() == Code::NotFound => "waiting",
        Err(e) => {
            error!("content info failed for {}: {e}", r#ref);
            "waiting"
        }
    }
}

fn timestamp_after(ts: &prost_types::Timestamp, start: SystemTime) -> bool {
    let Ok(start) = start.duration_since(UNIX_EPOCH) else {
        return false;
    };
    let ts_nanos = i128::from(ts.seconds) * 1_000_000_000 + i128::from(ts.nanos);
    ts_nanos > i128::try_from(start.as_nanos()).unwrap_or(i128::MAX)
}

/// Formats the table, carriage-return-newline terminated so it renders
/// correctly on the raw client TTY.
#[must_use]
pub fn render_table(rows: &[StatusRow], elapsed: Duration) -> String {
    let mut out = String::new();
    let mut total: i64 = 0;
    for row in rows {
        total += row.offset;
        match row.status {
            "downloading" | "uploading" => {
                out.push_str(&format!(
                    "{}:\t{}\t{}/{}\t\r\n",
                    row.r#ref,
                    row.status,
                    human_bytes(row.offset),
                    human_bytes(row.total),
                ));
            }
            _ => {
                out.push_str(&format!("{}:\t{}\t\r\n", row.r#ref, row.status));
            }
        }
    }
    out.push_str(&format!(
        "elapsed: {:.1}s\ttotal: {}\t\r\n",
        elapsed.as_secs_f64(),
        human_bytes(total),
    ));
    out
}

/// Byte counts rendered the way the containerd CLI renders them.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn human_bytes(n: i64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    if n <= 0 {
        return "0.0 B".to_string();
    }
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_records_in_stable_order() {
        let tracker = PullTracker::new();
        tracker.record("busybox", "layer-sha256:bbb");
        tracker.record("busybox", "layer-sha256:aaa");
        tracker.record("busybox", "layer-sha256:bbb");
        assert_eq!(
            tracker.refs("busybox"),
            vec!["layer-sha256:aaa", "layer-sha256:bbb"]
        );
        assert!(tracker.refs("alpine").is_empty());

        tracker.forget("busybox");
        assert!(tracker.refs("busybox").is_empty());
    }

    #[test]
    fn test_render_table_rows() {
        let rows = vec![
            StatusRow {
                r#ref: "docker.io/library/busybox:latest".into(),
                status: "resolved",
                offset: 0,
                total: 0,
            },
            StatusRow {
                r#ref: "layer-sha256:abc".into(),
                status: "downloading",
                offset: 1024,
                total: 4096,
            },
            StatusRow {
                r#ref: "config-sha256:def".into(),
                status: "exists",
                offset: 0,
                total: 0,
            },
        ];
        let table = render_table(&rows, Duration::from_millis(1500));
        let lines: Vec<&str> = table.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("docker.io/library/busybox:latest:\tresolved"));
        assert!(lines[1].contains("downloading\t1.0 KiB/4.0 KiB"));
        assert!(lines[2].contains("exists"));
        assert!(lines[3].starts_with("elapsed: 1.5s"));
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0.0 B");
        assert_eq!(human_bytes(512), "512.0 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_timestamp_after() {
        let now = SystemTime::now();
        let secs = now.duration_since(UNIX_EPOCH).unwrap().as_secs();
        let later = prost_types::Timestamp {
            seconds: i64::try_from(secs).unwrap() + 10,
            nanos: 0,
        };
        let earlier = prost_types::Timestamp {
            seconds: i64::try_from(secs).unwrap() - 10,
            nanos: 0,
        };
        assert!(timestamp_after(&later, now));
        assert!(!timestamp_after(&earlier, now));
    }
}
