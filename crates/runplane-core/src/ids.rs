// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource identifiers and timestamps.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;

const ALPHANUMERIC: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHIJKMNOPQRSTUVWXYZ0123456789";

const ID_SUFFIX_LEN: usize = 16;

static LAST_TIMESTAMP_MICROS: AtomicI64 = AtomicI64::new(0);

/// Build a resource ID of the form `<kind>-<16 alphanumeric characters>`.
pub fn new_id(kind: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())] as char)
        .collect();
    format!("{}-{}", kind, suffix)
}

/// Rewrite the kind prefix of an ID, e.g. `run-123` to `plan-123`.
///
/// IDs that are not of the `prefix-suffix` form are returned unchanged.
pub fn convert_id(id: &str, kind: &str) -> String {
    match id.split_once('-') {
        Some((_, suffix)) if !suffix.is_empty() && !suffix.contains('-') => {
            format!("{}-{}", kind, suffix)
        }
        _ => id.to_string(),
    }
}

/// Current UTC time truncated to microseconds.
///
/// Strictly increasing within a process, so records created back-to-back
/// always sort in creation order. Microsecond precision survives a round
/// trip through PostgreSQL `TIMESTAMPTZ`.
pub fn current_timestamp() -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6).timestamp_micros();
    let mut last = LAST_TIMESTAMP_MICROS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP_MICROS.compare_exchange_weak(
            last,
            next,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
            Err(actual) => last = actual,
        }
    }
}
