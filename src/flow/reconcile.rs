use bytes::Bytes;
use log::{error, info};

use super::messages::{build_announcement, build_config, config_version};
use super::store::{ConfigSnapshot, FilterVersions, Snapshot};
use crate::error_handling::types::WireError;

/// First protocol version that understands incremental filter updates.
pub const INCREMENTAL_PROTOCOL: u32 = 2;

/// Which clients a message is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Protocol version below 2: full filters only.
    Legacy,
    /// Protocol version 2 and up.
    Incremental,
}

impl Audience {
    pub fn of(protocol_version: u32) -> Self {
        if protocol_version >= INCREMENTAL_PROTOCOL {
            Audience::Incremental
        } else {
            Audience::Legacy
        }
    }

    pub fn accepts(&self, protocol_version: u32) -> bool {
        Audience::of(protocol_version) == *self
    }

    /// Config key of the filter this audience gets.
    pub fn filter_key(&self) -> &'static str {
        match self {
            Audience::Legacy => "filter",
            Audience::Incremental => "filter-diff",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub audience: Audience,
    pub payload: Bytes,
}

/// What a reconciliation tick decided.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub messages: Vec<Outgoing>,
    pub config_changed: bool,
    /// The diff cache must be dropped.
    pub invalidate: bool,
}

/// `'C'` payloads of one config, built when the config changes.
#[derive(Debug)]
struct ConfigPayloads {
    legacy: Result<Bytes, WireError>,
    incremental: Result<Bytes, WireError>,
}

impl ConfigPayloads {
    fn build(config: &ConfigSnapshot) -> Self {
        Self {
            legacy: build_config(config, Audience::Legacy.filter_key()),
            incremental: build_config(config, Audience::Incremental.filter_key()),
        }
    }

    fn get(&self, audience: Audience) -> &Result<Bytes, WireError> {
        match audience {
            Audience::Legacy => &self.legacy,
            Audience::Incremental => &self.incremental,
        }
    }
}

/// The last observed storage state.
#[derive(Debug, Default)]
pub struct Baseline {
    snapshot: Option<Snapshot>,
    configs: Option<ConfigPayloads>,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Version of the current config, if it has one.
    pub fn config_version(&self) -> Option<u32> {
        self.snapshot.as_ref().and_then(|s| config_version(&s.config))
    }

    /// The `'C'` message for a client speaking `protocol_version`; `None`
    /// before the first snapshot.
    pub fn config_for(&self, protocol_version: u32) -> Option<&Result<Bytes, WireError>> {
        let configs = self.configs.as_ref()?;
        Some(configs.get(Audience::of(protocol_version)))
    }

    /// Compares `snapshot` with the previous one, decides what to send and
    /// makes it the new baseline.
    ///
    /// A config change resends the config to everyone and announces every
    /// filter. Otherwise only filters whose version moved (or that are new)
    /// are announced. Filters that disappeared are not mentioned.
    pub fn reconcile(&mut self, snapshot: Snapshot) -> Reconciled {
        let mut result = Reconciled::default();
        let previous = self.snapshot.take();

        let config_changed = previous
            .as_ref()
            .map_or(true, |old| old.config != snapshot.config);
        if config_changed {
            info!("Config changed, broadcasting");
            result.config_changed = true;
            let configs = ConfigPayloads::build(&snapshot.config);
            for audience in [Audience::Legacy, Audience::Incremental] {
                match configs.get(audience) {
                    Ok(payload) => result.messages.push(Outgoing {
                        audience,
                        payload: payload.clone(),
                    }),
                    Err(e) => error!("Unable to build config for {audience:?} clients: {e}"),
                }
            }
            self.configs = Some(configs);
            announce(&mut result, &snapshot.filters, |_, _| true);
            result.invalidate = true;
        } else {
            let old = previous.map(|p| p.filters).unwrap_or_default();
            announce(&mut result, &snapshot.filters, |name, current| {
                old.get(name) != Some(current)
            });
            result.invalidate = !result.messages.is_empty();
        }

        self.snapshot = Some(snapshot);
        result
    }
}

fn announce<P>(result: &mut Reconciled, filters: &FilterVersions, changed: P)
where
    P: Fn(&str, &(u32, u32)) -> bool,
{
    for (name, current) in filters {
        if changed(name, current) {
            let (epoch, version) = *current;
            result.messages.push(Outgoing {
                audience: Audience::Incremental,
                payload: build_announcement(name, epoch, version),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::store::ConfigSnapshot;

    fn config() -> ConfigSnapshot {
        [
            ("version", "1"),
            ("max_flows", "10"),
            ("timeout", "20"),
            ("minpackets", "3"),
            ("filter", "T"),
            ("filter-diff", "F"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn snapshot(filters: &[(&str, u32, u32)]) -> Snapshot {
        Snapshot {
            config: config(),
            filters: filters
                .iter()
                .map(|(name, epoch, version)| (name.to_string(), (*epoch, *version)))
                .collect(),
        }
    }

    #[test]
    fn test_audience() {
        assert_eq!(Audience::of(0), Audience::Legacy);
        assert_eq!(Audience::of(1), Audience::Legacy);
        assert_eq!(Audience::of(2), Audience::Incremental);
        assert!(Audience::Incremental.accepts(7));
        assert!(!Audience::Legacy.accepts(2));
    }

    #[test]
    fn test_first_snapshot_broadcasts_everything() {
        let mut baseline = Baseline::new();
        assert!(!baseline.is_loaded());
        assert!(baseline.config_for(1).is_none());

        let result = baseline.reconcile(snapshot(&[("f", 1, 4), ("g", 2, 1)]));
        assert!(result.config_changed);
        assert!(result.invalidate);
        assert_eq!(result.messages.len(), 4);
        assert_eq!(result.messages[0].audience, Audience::Legacy);
        assert_eq!(&result.messages[0].payload[17..], b"T");
        assert_eq!(result.messages[1].audience, Audience::Incremental);
        assert_eq!(&result.messages[1].payload[17..], b"F");
        assert_eq!(result.messages[2].payload, build_announcement("f", 1, 4));
        assert_eq!(result.messages[3].payload, build_announcement("g", 2, 1));
        assert_eq!(baseline.config_version(), Some(1));
    }

    #[test]
    fn test_only_changed_filter_is_announced() {
        let mut baseline = Baseline::new();
        baseline.reconcile(snapshot(&[("f", 1, 4), ("g", 2, 1)]));

        let result = baseline.reconcile(snapshot(&[("f", 1, 5), ("g", 2, 1)]));
        assert!(!result.config_changed);
        assert!(result.invalidate);
        assert_eq!(
            result.messages,
            vec![Outgoing {
                audience: Audience::Incremental,
                payload: build_announcement("f", 1, 5),
            }]
        );
    }

    #[test]
    fn test_new_filter_announced_disappeared_not() {
        let mut baseline = Baseline::new();
        baseline.reconcile(snapshot(&[("f", 1, 4)]));

        let result = baseline.reconcile(snapshot(&[("h", 1, 1)]));
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].payload, build_announcement("h", 1, 1));
    }

    #[test]
    fn test_unchanged_snapshot_is_quiet() {
        let mut baseline = Baseline::new();
        baseline.reconcile(snapshot(&[("f", 1, 4)]));
        let result = baseline.reconcile(snapshot(&[("f", 1, 4)]));
        assert!(result.messages.is_empty());
        assert!(!result.invalidate);
    }

    #[test]
    fn test_epoch_bump_is_a_change() {
        let mut baseline = Baseline::new();
        baseline.reconcile(snapshot(&[("f", 1, 4)]));
        let result = baseline.reconcile(snapshot(&[("f", 2, 1)]));
        assert_eq!(result.messages[0].payload, build_announcement("f", 2, 1));
    }

    #[test]
    fn test_config_payloads_follow_config_changes() {
        let mut baseline = Baseline::new();
        let first = baseline.reconcile(snapshot(&[]));
        assert_eq!(baseline.config_for(1), Some(&Ok(first.messages[0].payload.clone())));
        assert_eq!(baseline.config_for(2), Some(&Ok(first.messages[1].payload.clone())));

        let mut changed = snapshot(&[]);
        changed.config.insert("filter".into(), "!(F)".into());
        baseline.reconcile(changed);
        let legacy = baseline.config_for(0).unwrap().as_ref().unwrap();
        assert_eq!(&legacy[17..], b"!F");
        let incremental = baseline.config_for(2).unwrap().as_ref().unwrap();
        assert_eq!(incremental, &first.messages[1].payload);
    }

    #[test]
    fn test_broken_config_still_becomes_baseline() {
        let mut baseline = Baseline::new();
        let mut broken = snapshot(&[("f", 1, 1)]);
        broken.config.insert("max_flows".into(), "many".into());

        let result = baseline.reconcile(broken.clone());
        assert!(result.config_changed);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].audience, Audience::Incremental);
        assert!(baseline.config_for(1).unwrap().is_err());

        assert!(baseline.reconcile(broken).messages.is_empty());
    }
}
