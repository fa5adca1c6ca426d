//! Quota limit arithmetic
//!
//! Grace limits are written as a percentage of headroom above the requested
//! capacity (`"20%"` on a 10Gi claim allows 12Gi). Quota tools want absolute
//! sizes in KiB, rendered as `<n>k`.

use crate::config::QuotaGrace;
use crate::error::{Error, Result};

/// Token meaning "no limit requested"
pub const UNSET_LIMIT: &str = "0k";

const KIB: f64 = 1024.0;

/// Absolute soft/hard limits ready for the quota helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaLimits {
    pub soft: String,
    pub hard: String,
}

impl QuotaLimits {
    /// Both limits are `<digits>k` tokens
    pub fn is_well_formed(&self) -> bool {
        is_size_token(&self.soft) && is_size_token(&self.hard)
    }
}

/// Convert a grace percentage into an absolute `<n>k` limit.
///
/// Empty input yields [`UNSET_LIMIT`]. The percentage is capped at 100.
pub fn to_absolute(grace: &str, capacity_bytes: i64) -> Result<String> {
    if grace.is_empty() {
        return Ok(UNSET_LIMIT.to_string());
    }

    let number = grace
        .strip_suffix('%')
        .filter(|n| is_decimal(n))
        .ok_or_else(|| Error::InvalidQuotaFormat(grace.to_string()))?;

    let percent: f64 = number
        .parse()
        .map_err(|_| Error::InvalidQuotaFormat(grace.to_string()))?;
    let percent = percent.min(100.0);

    let capacity = capacity_bytes as f64;
    let kib = ((capacity + capacity * percent / 100.0) / KIB).ceil();

    Ok(format!("{}k", kib as i64))
}

/// Convert both grace settings and check their order.
///
/// When neither limit is set both become the raw capacity, making the
/// quota a hard cap at the requested size. When only one is set the unset
/// one stays [`UNSET_LIMIT`].
pub fn resolve_limits(grace: &QuotaGrace, capacity_bytes: i64) -> Result<QuotaLimits> {
    let soft = to_absolute(&grace.soft, capacity_bytes)?;
    let hard = to_absolute(&grace.hard, capacity_bytes)?;

    if soft == UNSET_LIMIT && hard == UNSET_LIMIT {
        let capacity = format!("{}k", (capacity_bytes as f64 / KIB).ceil() as i64);
        return Ok(QuotaLimits {
            soft: capacity.clone(),
            hard: capacity,
        });
    }

    if soft == UNSET_LIMIT || hard == UNSET_LIMIT {
        return Ok(QuotaLimits { soft, hard });
    }

    // Equal-width tokens compare lexically the same as numerically.
    if soft.len() > hard.len() || (soft.len() == hard.len() && soft > hard) {
        return Err(Error::QuotaLimitOrder { soft, hard });
    }

    Ok(QuotaLimits { soft, hard })
}

/// `<digits>[.<digits>]` with at least one digit
fn is_decimal(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    !(int.is_empty() && frac.is_empty())
        && int.chars().all(|c| c.is_ascii_digit())
        && frac.chars().all(|c| c.is_ascii_digit())
}

fn is_size_token(s: &str) -> bool {
    s.strip_suffix('k')
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}
