use crate::models::{RawStats, WastedSpace};

/// Bytes the server intentionally keeps free on each page to honour fillfactor.
pub fn reserved_bytes(relpages: i64, fillfactor: f64, block_size: i64) -> f64 {
    let reserved = relpages as f64 * (100.0 - fillfactor) * block_size as f64 / 100.0;
    reserved.max(0.0)
}

/// Wasted space of an object, clamped at zero.
///
/// Free space that only fills the fillfactor reserve is not waste, so an
/// object sitting exactly at its fillfactor reports nothing.
pub fn compute(stats: &RawStats, fillfactor: f64, block_size: i64) -> WastedSpace {
    let reserved = reserved_bytes(stats.relpages, fillfactor, block_size);

    let wasted_bytes = stats.raw_wasted_bytes() as f64 - reserved;
    let wasted_percent = stats.raw_wasted_percent() - (100.0 - fillfactor);

    WastedSpace {
        reserved_bytes: reserved,
        wasted_bytes: if wasted_bytes > 0.0 {
            wasted_bytes.round() as i64
        } else {
            0
        },
        wasted_percent: if wasted_percent > 0.0 {
            wasted_percent
        } else {
            0.0
        },
    }
}
