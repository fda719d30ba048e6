//! Candidate RFCOMM channel selection.
//!
//! SDP is the proper source for the channel number, but some firmware
//! advertises nothing useful. The candidate list therefore always ends with
//! an exhaustive sweep of the legal RFCOMM range.

use std::collections::HashSet;
use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::executor::RunLoopExecutor;
use crate::radio::RadioStack;
use crate::sdp::ServiceRecord;

pub const MIN_CHANNEL: u8 = 1;
pub const MAX_CHANNEL: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSource {
    SdpDiscovered,
    UserSpecified,
    BruteForce,
}

impl fmt::Display for ChannelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelSource::SdpDiscovered => "sdp",
            ChannelSource::UserSpecified => "user",
            ChannelSource::BruteForce => "sweep",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateChannel {
    pub id: u8,
    pub source: ChannelSource,
    pub service_name: Option<String>,
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Discovery {
    pub records: Vec<ServiceRecord>,
    pub candidates: Vec<CandidateChannel>,
    /// Set when the fresh query failed and cached records were used.
    pub query_error: Option<String>,
}

pub fn is_valid_channel(id: u8) -> bool {
    (MIN_CHANNEL..=MAX_CHANNEL).contains(&id)
}

/// Order candidates: SDP channels in record order, then `fallback`, then
/// every remaining channel in 1..=30 ascending. No channel appears twice.
pub fn order_candidates(records: &[ServiceRecord], fallback: u8) -> Vec<CandidateChannel> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(MAX_CHANNEL as usize);

    for record in records {
        let Some(id) = record.rfcomm_channel else {
            continue;
        };
        if !is_valid_channel(id) {
            warn!("ignoring out-of-range RFCOMM channel {} from SDP", id);
            continue;
        }
        if seen.insert(id) {
            out.push(CandidateChannel {
                id,
                source: ChannelSource::SdpDiscovered,
                service_name: record.name.clone(),
            });
        }
    }

    if is_valid_channel(fallback) && seen.insert(fallback) {
        out.push(CandidateChannel {
            id: fallback,
            source: ChannelSource::UserSpecified,
            service_name: None,
        });
    }

    for id in MIN_CHANNEL..=MAX_CHANNEL {
        if seen.insert(id) {
            out.push(CandidateChannel {
                id,
                source: ChannelSource::BruteForce,
                service_name: None,
            });
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ChannelLocator {
    /// Pause after triggering the query, for stacks that fill records in
    /// asynchronously.
    pub settle: Duration,
    pub query_timeout: Duration,
}

impl ChannelLocator {
    pub fn new(settle: Duration, query_timeout: Duration) -> Self {
        Self {
            settle,
            query_timeout,
        }
    }

    /// Run a fresh SDP query on the executor thread and build the candidate
    /// list. A failed query falls back to whatever records the stack has
    /// cached.
    pub fn discover<S: RadioStack + 'static>(
        &self,
        executor: &RunLoopExecutor<S>,
        fallback: u8,
    ) -> Discovery {
        let query_timeout = self.query_timeout;
        let query_error = match executor.schedule_and_wait(query_timeout + self.settle, move |s| {
            s.query_services(query_timeout)
        }) {
            Ok(()) => None,
            Err(e) => {
                warn!("SDP query failed, using cached records: {}", e);
                Some(e.to_string())
            }
        };

        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }

        let records = executor
            .schedule_and_wait(query_timeout, |s| Ok(s.services()))
            .unwrap_or_else(|e| {
                debug!("reading service records failed: {}", e);
                Vec::new()
            });

        for record in &records {
            info!(
                "SDP record: name={:?}, channel={:?}, spp={}",
                record.name,
                record.rfcomm_channel,
                record.is_serial_port()
            );
        }

        let candidates = order_candidates(&records, fallback);
        let from_sdp = candidates
            .iter()
            .filter(|c| c.source == ChannelSource::SdpDiscovered)
            .count();
        info!(
            "{} candidate channels ({} from SDP, fallback {})",
            candidates.len(),
            from_sdp,
            fallback
        );

        Discovery {
            records,
            candidates,
            query_error,
        }
    }
}
