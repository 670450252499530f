use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use log::{debug, error, trace, warn};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, Set};

use super::batch::{Direction, FlowBatch, FlowRecord, Protocol};
use crate::error_handling::types::IngestError;
use crate::storage::db_entities::{clients, flows};
use crate::storage::Database;

/// Oldest accepted event time, relative to the batch calibration time.
pub const MAX_LAG_MS: i128 = 86_400_000;

const INSERT_CHUNK: usize = 500;

/// One direction of a flow, ready to be stored.
///
/// Times are ages in milliseconds before the batch calibration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEvent {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub start_age: i64,
    pub end_age: i64,
    pub opposite_start_age: Option<i64>,
    pub bytes: u64,
    pub packets: u32,
    pub inbound: bool,
}

/// Age of `t` relative to `calibration`, if it is recent enough to store.
fn age(calibration: u64, t: u64) -> Option<i64> {
    let lag = calibration as i128 - t as i128;
    if lag > MAX_LAG_MS {
        return None;
    }
    i64::try_from(lag).ok()
}

fn direction_event(
    record: &FlowRecord,
    calibration: u64,
    inbound: bool,
    client: &str,
) -> Option<FlowEvent> {
    let (this, other) = if inbound {
        (&record.inbound, &record.outbound)
    } else {
        (&record.outbound, &record.inbound)
    };
    if this.packets == 0 {
        return None;
    }

    let label = if inbound { "in" } else { "out" };
    let (Some(start_age), Some(end_age)) = (age(calibration, this.first), age(calibration, this.last))
    else {
        error!(
            "Time difference out of range for client {client} and {label} direction: {} / {}",
            calibration as i128 - this.first as i128,
            calibration as i128 - this.last as i128
        );
        return None;
    };

    let opposite_start_age = opposite_age(other, calibration);
    let (src_addr, dst_addr, src_port, dst_port) = if inbound {
        (record.remote_addr, record.local_addr, record.remote_port, record.local_port)
    } else {
        (record.local_addr, record.remote_addr, record.local_port, record.remote_port)
    };

    Some(FlowEvent {
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        protocol: record.protocol,
        start_age,
        end_age,
        opposite_start_age,
        bytes: this.bytes,
        packets: this.packets,
        inbound,
    })
}

fn opposite_age(other: &Direction, calibration: u64) -> Option<i64> {
    if other.packets == 0 {
        return None;
    }
    i64::try_from(calibration as i128 - other.first as i128).ok()
}

/// Splits every record into its inbound and outbound events, dropping empty
/// directions and the ones whose timing is too far in the past.
pub fn split_events(batch: &FlowBatch, client: &str) -> Vec<FlowEvent> {
    let mut events = Vec::with_capacity(batch.records.len() * 2);
    for record in &batch.records {
        trace!(
            "Flow times: {}, {}, {}, {}, {} ({}/{} packets)",
            batch.calibration,
            record.inbound.first,
            record.outbound.first,
            record.inbound.last,
            record.outbound.last,
            record.inbound.packets,
            record.outbound.packets
        );
        events.extend(direction_event(record, batch.calibration, true, client));
        events.extend(direction_event(record, batch.calibration, false, client));
    }
    events
}

fn timestamp(now: DateTime<Utc>, age: i64) -> Option<String> {
    let at = now.checked_sub_signed(TimeDelta::try_milliseconds(age)?)?;
    Some(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// `None` when a time or the byte count has no column representation.
fn to_row(event: &FlowEvent, client_id: i32, now: DateTime<Utc>) -> Option<flows::ActiveModel> {
    let opposite_start = match event.opposite_start_age {
        Some(age) => Some(timestamp(now, age)?),
        None => None,
    };
    Some(flows::ActiveModel {
        client: Set(client_id),
        ip_from: Set(event.src_addr.to_string()),
        ip_to: Set(event.dst_addr.to_string()),
        port_from: Set(i32::from(event.src_port)),
        port_to: Set(i32::from(event.dst_port)),
        proto: Set(event.protocol.as_str().to_string()),
        start: Set(timestamp(now, event.start_age)?),
        stop: Set(timestamp(now, event.end_age)?),
        opposite_start: Set(opposite_start),
        size: Set(i64::try_from(event.bytes).ok()?),
        count: Set(i64::from(event.packets)),
        inbound: Set(event.inbound),
        ..Default::default()
    })
}

/// Decodes a flow batch from `client` and stores its events in one
/// transaction. Returns the number of rows written.
///
/// `expected_config` is the config version currently broadcast, if any; a
/// batch collected under another one is still stored.
pub fn store_flows(
    db: &mut Database,
    client: &str,
    data: &[u8],
    expected_config: Option<u32>,
) -> Result<usize, IngestError> {
    let batch = FlowBatch::decode(data)?;

    if let Some(expected) = expected_config {
        if batch.config_id != expected {
            warn!(
                "Flows of different config ({} vs. {expected}) received from client {client}",
                batch.config_id
            );
        }
    }
    if batch.discarded > 0 {
        warn!(
            "Discarding {} trailing bytes of a flow batch from client {client}",
            batch.discarded
        );
    }
    if batch.records.is_empty() {
        warn!("Empty list of flows from {client}");
        return Ok(0);
    }

    let events = split_events(&batch, client);
    if events.is_empty() {
        debug!("No storable flow events from {client}");
        return Ok(0);
    }

    let now = db.now()?;
    let client_name = client.to_string();
    let stored = db.transaction(true, |cursor| {
        let known = cursor.block_on(
            clients::Entity::find()
                .filter(clients::Column::Name.eq(client_name.as_str()))
                .one(cursor.connection()),
        )?;
        let Some(known) = known else {
            return Ok(None);
        };

        let rows: Vec<_> = events
            .iter()
            .filter_map(|event| {
                let row = to_row(event, known.id, now);
                if row.is_none() {
                    error!("Flow event from {client_name} does not fit a row, dropping: {event:?}");
                }
                row
            })
            .collect();
        let stored = rows.len();
        for chunk in rows.chunks(INSERT_CHUNK) {
            cursor.block_on(flows::Entity::insert_many(chunk.to_vec()).exec(cursor.connection()))?;
        }
        Ok(Some(stored))
    })?;

    match stored {
        Some(count) => {
            debug!("Stored {count} flow events from {client}");
            Ok(count)
        }
        None => Err(IngestError::UnknownClient(client.to_string())),
    }
}
