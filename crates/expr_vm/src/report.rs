//! Packed tier reports.
//!
//! A report is one word holding eight 32-bit lanes. Lane `i` (bits `32i..32i+32`) is the
//! earliest time the subject reached tier `i + 1`; [`NEVER`] marks a tier never reached.
//! Lanes are expected to be non-decreasing with tier index, but nothing here enforces it.

use ruint::aliases::U256;

use crate::types::Word;

/// Lane value for a tier that was never reached.
pub const NEVER: u32 = u32::MAX;

/// Number of lanes (tiers) in one report.
pub const TIERS: usize = 8;

/// Report with every lane set to [`NEVER`].
pub const NEVER_REPORT: Word = U256::MAX;

/// Most reports `select_lte` accepts at once.
pub const MAX_SELECT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("tier index {0} out of range (max 7)")]
    MaxTier(usize),
    #[error("select over {0} reports (expected 1..=8)")]
    SelectArity(usize),
    #[error("time does not fit a 32-bit lane")]
    TimeOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    /// At least one report eligible.
    Any,
    /// All reports eligible.
    Every,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Earliest eligible time.
    Min,
    /// Latest eligible time.
    Max,
    /// Time from the first eligible report in list order.
    First,
}

impl Logic {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Logic::Any),
            1 => Some(Logic::Every),
            _ => None,
        }
    }
}

impl Mode {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Mode::Min),
            1 => Some(Mode::Max),
            2 => Some(Mode::First),
            _ => None,
        }
    }
}

/// Splits a report into its eight lanes, tier 1 first.
pub fn lanes(report: Word) -> [u32; TIERS] {
    let limbs = report.as_limbs();
    let mut out = [0u32; TIERS];
    for (i, lane) in out.iter_mut().enumerate() {
        *lane = (limbs[i / 2] >> ((i % 2) * 32)) as u32;
    }
    out
}

/// Packs eight lanes into a report.
pub fn from_lanes(lanes: [u32; TIERS]) -> Word {
    let mut limbs = [0u64; 4];
    for (i, lane) in lanes.into_iter().enumerate() {
        limbs[i / 2] |= u64::from(lane) << ((i % 2) * 32);
    }
    U256::from_limbs(limbs)
}

fn check_tier(tier: usize) -> Result<(), ReportError> {
    if tier >= TIERS {
        return Err(ReportError::MaxTier(tier));
    }
    Ok(())
}

pub fn read_lane(report: Word, tier: usize) -> Result<u32, ReportError> {
    check_tier(tier)?;
    Ok(lanes(report)[tier])
}

/// Sets every lane above `tier` to [`NEVER`]; lanes `0..=tier` are kept.
pub fn truncate_above(report: Word, tier: usize) -> Result<Word, ReportError> {
    check_tier(tier)?;
    let mut l = lanes(report);
    for lane in l.iter_mut().skip(tier + 1) {
        *lane = NEVER;
    }
    Ok(from_lanes(l))
}

/// Sets lanes `start..=end` to `time`. `start > end` leaves the report unchanged.
pub fn update_range(report: Word, start: usize, end: usize, time: u32) -> Result<Word, ReportError> {
    check_tier(start)?;
    check_tier(end)?;
    if start > end {
        return Ok(report);
    }
    let mut l = lanes(report);
    for lane in &mut l[start..=end] {
        *lane = time;
    }
    Ok(from_lanes(l))
}

/// Lane-wise `max(0, a - b)`.
pub fn saturating_diff(a: Word, b: Word) -> Word {
    let (a, b) = (lanes(a), lanes(b));
    let mut out = [0u32; TIERS];
    for i in 0..TIERS {
        out[i] = a[i].saturating_sub(b[i]);
    }
    from_lanes(out)
}

/// Combines reports lane by lane.
///
/// A lane is eligible when it is at or before `reference` and is not [`NEVER`]. For every
/// tier the eligibility of all reports is combined per `logic`; when it holds, the resulting
/// lane is chosen per `mode`, otherwise it is [`NEVER`]. `Mode::First` follows list order.
pub fn select_lte(
    reports: &[Word],
    logic: Logic,
    mode: Mode,
    reference: Word,
) -> Result<Word, ReportError> {
    if reports.is_empty() || reports.len() > MAX_SELECT {
        return Err(ReportError::SelectArity(reports.len()));
    }
    let split: Vec<[u32; TIERS]> = reports.iter().map(|r| lanes(*r)).collect();
    let mut out = [NEVER; TIERS];
    for (tier, slot) in out.iter_mut().enumerate() {
        let mut chosen: Option<u32> = None;
        let mut all = true;
        for report in &split {
            let lane = report[tier];
            if lane == NEVER || U256::from(lane) > reference {
                all = false;
                continue;
            }
            chosen = Some(match (chosen, mode) {
                (None, _) => lane,
                (Some(c), Mode::Min) => c.min(lane),
                (Some(c), Mode::Max) => c.max(lane),
                (Some(c), Mode::First) => c,
            });
        }
        let holds = match logic {
            Logic::Any => chosen.is_some(),
            Logic::Every => all,
        };
        if holds {
            if let Some(c) = chosen {
                *slot = c;
            }
        }
    }
    Ok(from_lanes(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(l: [u32; TIERS]) -> Word {
        from_lanes(l)
    }

    #[test]
    fn lane_zero_is_lowest_bits() {
        let r = report([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(r & U256::from(u32::MAX), U256::from(1u64));
        assert_eq!(r >> 224usize, U256::from(8u64));
        assert_eq!(lanes(r), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn never_report_is_all_ones() {
        assert_eq!(lanes(NEVER_REPORT), [NEVER; TIERS]);
    }

    #[test]
    fn read_lane_rejects_tier_eight() {
        assert_eq!(read_lane(U256::ZERO, 8), Err(ReportError::MaxTier(8)));
        assert_eq!(read_lane(report([0, 0, 0, 0, 0, 0, 0, 9]), 7), Ok(9));
    }

    #[test]
    fn truncate_above_keeps_lower_lanes() {
        let r = report([10, 20, 30, 40, 50, 60, 70, 80]);
        let t = truncate_above(r, 2).unwrap();
        assert_eq!(lanes(t), [10, 20, 30, NEVER, NEVER, NEVER, NEVER, NEVER]);
        assert_eq!(truncate_above(r, 7).unwrap(), r);
        assert!(truncate_above(r, 8).is_err());
    }

    #[test]
    fn update_range_inverted_is_noop() {
        let r = report([1; TIERS]);
        assert_eq!(update_range(r, 5, 2, 99).unwrap(), r);
        assert_eq!(update_range(r, 2, 9, 99), Err(ReportError::MaxTier(9)));
    }

    #[test]
    fn update_range_sets_inclusive_span() {
        let r = report([1; TIERS]);
        let u = update_range(r, 2, 4, 99).unwrap();
        assert_eq!(lanes(u), [1, 1, 99, 99, 99, 1, 1, 1]);
    }

    #[test]
    fn saturating_diff_clamps_at_zero() {
        let a = report([10, 5, 0, 0, 0, 0, 0, NEVER]);
        let b = report([3, 9, 0, 0, 0, 0, 0, 1]);
        assert_eq!(lanes(saturating_diff(a, b)), [7, 0, 0, 0, 0, 0, 0, NEVER - 1]);
    }

    #[test]
    fn select_lte_modes() {
        let a = report([100, 150, NEVER, NEVER, NEVER, NEVER, NEVER, NEVER]);
        let b = report([50, 200, 120, NEVER, NEVER, NEVER, NEVER, NEVER]);
        let t = U256::from(160u64);

        let min = lanes(select_lte(&[a, b], Logic::Any, Mode::Min, t).unwrap());
        assert_eq!(&min[..3], &[50, 150, 120]);

        let max = lanes(select_lte(&[a, b], Logic::Any, Mode::Max, t).unwrap());
        assert_eq!(&max[..3], &[100, 150, 120]);

        let first = lanes(select_lte(&[a, b], Logic::Any, Mode::First, t).unwrap());
        assert_eq!(&first[..3], &[100, 150, 120]);

        let every = lanes(select_lte(&[a, b], Logic::Every, Mode::Min, t).unwrap());
        assert_eq!(&every[..3], &[50, NEVER, NEVER]);
    }

    #[test]
    fn select_lte_first_follows_list_order() {
        let a = report([100; TIERS]);
        let b = report([50; TIERS]);
        let t = U256::from(1_000u64);
        assert_eq!(lanes(select_lte(&[a, b], Logic::Any, Mode::First, t).unwrap())[0], 100);
        assert_eq!(lanes(select_lte(&[b, a], Logic::Any, Mode::First, t).unwrap())[0], 50);
    }

    #[test]
    fn select_lte_never_lanes_are_ineligible() {
        let r = NEVER_REPORT;
        let out = select_lte(&[r], Logic::Any, Mode::Min, U256::MAX).unwrap();
        assert_eq!(out, NEVER_REPORT);
    }

    #[test]
    fn select_lte_arity() {
        assert_eq!(
            select_lte(&[], Logic::Any, Mode::Min, U256::ZERO),
            Err(ReportError::SelectArity(0))
        );
        let nine = [U256::ZERO; 9];
        assert_eq!(
            select_lte(&nine, Logic::Any, Mode::Min, U256::ZERO),
            Err(ReportError::SelectArity(9))
        );
    }
}
