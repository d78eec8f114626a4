//! Dotted firmware version numbers.
//!
//! Versions are compared component by component as integers. A `-N` build
//! suffix is treated as one more component, so `1.3.2-9` sorts after `1.3.2`.
//! Missing components count as zero.

use crate::error::{DfuError, Result};
use std::cmp::Ordering;

fn components(version: &str) -> Vec<u64> {
    version
        .trim()
        .split(['.', '-'])
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Compare two version strings
pub fn compare_versions(lhs: &str, rhs: &str) -> Ordering {
    let lhs = components(lhs);
    let rhs = components(rhs);
    let len = lhs.len().max(rhs.len());
    for i in 0..len {
        let l = lhs.get(i).copied().unwrap_or(0);
        let r = rhs.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// `version >= minimum`
pub fn is_at_least(version: &str, minimum: &str) -> bool {
    compare_versions(version, minimum) != Ordering::Less
}

/// `version < maximum`
pub fn is_before(version: &str, maximum: &str) -> bool {
    compare_versions(version, maximum) == Ordering::Less
}

/// Bootloader version assumed for an application that cannot report it.
///
/// Bootloader 1.0 shipped with application 1.3.0, and anything older is
/// treated as 0.0.26 (that update path is backwards compatible). From 1.4.0
/// on the application exposes its bootloader version, so it has to be read
/// from the peripheral instead of guessed.
pub fn implied_bootloader_version(application: &str) -> Result<&'static str> {
    if is_at_least(application, "1.4.0") {
        Err(DfuError::UnknownBootloaderVersion)
    } else if is_at_least(application, "1.3.0") {
        Ok("1.0.0")
    } else {
        Ok("0.0.26")
    }
}
