//! Request matrix and grant resolution.
//!
//! Each cycle every ingress port presents at most one flit (its selected
//! VC). The matrix records which outputs each of those flits may still
//! contend for, then the per-output arbiters pick winners and multicast
//! packets are reconciled so that they advance on all destinations at
//! once or not at all.
//!
//! # Grant rules
//!
//! 1. A row only keeps outputs the caller reports as ready.
//! 2. A multicast row that lost any destination is withdrawn entirely.
//! 3. Each output's arbiter picks one input from its column.
//! 4. A multicast input that won its leading leg (lowest destination) is
//!    forced onto all its destinations. The force is voided when a
//!    destination was not ready or is already held by another multicast.
//!    Outputs won by a multicast input that did not win its leading leg
//!    are released.
//!
//! Leading legs are visited in output order, so between two overlapping
//! multicasts the one whose lowest destination is lower always commits
//! first. The other one can starve even while its remaining outputs idle.

use super::arbiter::Arbiter;
use super::bits::PortMask;

/// One input's request this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contender {
    pub input: usize,
    pub vc: usize,
    pub dest: PortMask,
    pub multicast: bool,
    pub is_header: bool,
}

/// Valid (input, output) pairs for one cycle.
#[derive(Debug, Clone)]
pub struct RequestMatrix {
    rows: Vec<PortMask>,
}

impl RequestMatrix {
    /// Build rows from `contenders`, indexed by input port.
    ///
    /// `ready(contender, output)` decides whether one destination is
    /// admissible this cycle; it is only asked about outputs in the
    /// contender's destination mask.
    pub fn build<F>(contenders: &[Option<Contender>], num_outputs: usize, mut ready: F) -> Self
    where
        F: FnMut(&Contender, usize) -> bool,
    {
        let rows = contenders
            .iter()
            .map(|c| match c {
                Some(c) => c
                    .dest
                    .iter()
                    .filter(|&k| k < num_outputs && ready(c, k))
                    .collect(),
                None => PortMask::EMPTY,
            })
            .collect();
        Self { rows }
    }

    pub fn row(&self, input: usize) -> PortMask {
        self.rows[input]
    }

    /// Inputs that may send to `output`.
    pub fn column(&self, output: usize) -> PortMask {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.contains(output))
            .map(|(i, _)| i)
            .collect()
    }

    /// Drop every request of a multicast input whose row is partial.
    ///
    /// Returns the number of inputs withdrawn.
    pub fn withdraw_partial_multicast(&mut self, contenders: &[Option<Contender>]) -> usize {
        let mut withdrawn = 0;
        for (row, c) in self.rows.iter_mut().zip(contenders) {
            if let Some(c) = c {
                if c.multicast && !row.is_empty() && *row != c.dest {
                    log::trace!("Withdraw multicast input {} ({} of {})", c.input, row, c.dest);
                    *row = PortMask::EMPTY;
                    withdrawn += 1;
                }
            }
        }
        withdrawn
    }
}

/// Outcome of one arbitration round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grants {
    /// Winning input per output
    pub select: Vec<Option<usize>>,
    /// Outputs granted per input
    pub granted: Vec<PortMask>,
    /// Multicast inputs withdrawn for a partial row
    pub withdrawn: usize,
    /// Forced multicast grants voided after re-validation
    pub voided: usize,
}

impl Grants {
    pub fn is_empty(&self) -> bool {
        self.granted.iter().all(|g| g.is_empty())
    }
}

/// Run one round of arbitration over `contenders`.
///
/// `arbiters` holds one arbiter per output.
pub fn arbitrate<F>(contenders: &[Option<Contender>], arbiters: &mut [Arbiter], ready: F) -> Grants
where
    F: FnMut(&Contender, usize) -> bool,
{
    let num_outputs = arbiters.len();
    let mut matrix = RequestMatrix::build(contenders, num_outputs, ready);
    let withdrawn = matrix.withdraw_partial_multicast(contenders);

    let picks: Vec<Option<usize>> = arbiters
        .iter_mut()
        .enumerate()
        .map(|(k, arb)| arb.pick_index(matrix.column(k)))
        .collect();
    let mut select = picks.clone();

    // Multicast reconciliation, visiting leading legs in output order
    let mut claimed = PortMask::EMPTY;
    let mut committed = vec![false; contenders.len()];
    let mut voided = 0;
    for (k, pick) in picks.iter().enumerate() {
        let Some(i) = *pick else { continue };
        let Some(c) = contenders[i] else { continue };
        if !c.multicast || c.dest.lowest() != Some(k) {
            continue;
        }

        let row = matrix.row(i);
        if row != c.dest || claimed.intersects(c.dest) {
            log::debug!("Void multicast grant for input {} on {}", i, c.dest);
            voided += 1;
            continue;
        }
        for d in c.dest.iter() {
            select[d] = Some(i);
        }
        claimed |= c.dest;
        committed[i] = true;
    }

    // Release outputs held by multicast inputs that were not committed
    for slot in select.iter_mut() {
        if let Some(i) = *slot {
            if contenders[i].map_or(false, |c| c.multicast) && !committed[i] {
                *slot = None;
            }
        }
    }

    let mut granted = vec![PortMask::EMPTY; contenders.len()];
    for (k, slot) in select.iter().enumerate() {
        if let Some(i) = *slot {
            granted[i].insert(k);
        }
    }

    Grants { select, granted, withdrawn, voided }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ArbiterKind;

    fn arbiters(n: usize) -> Vec<Arbiter> {
        (0..n).map(|_| Arbiter::new(n, ArbiterKind::RoundRobin)).collect()
    }

    fn unicast(input: usize, output: usize) -> Option<Contender> {
        Some(Contender {
            input,
            vc: 0,
            dest: PortMask::one_hot(output),
            multicast: false,
            is_header: true,
        })
    }

    fn multicast(input: usize, dest: u64) -> Option<Contender> {
        Some(Contender {
            input,
            vc: 0,
            dest: PortMask::from_bits(dest),
            multicast: true,
            is_header: true,
        })
    }

    #[test]
    fn test_matrix_rows_and_columns() {
        let contenders = vec![unicast(0, 2), None, multicast(2, 0b0101)];
        let matrix = RequestMatrix::build(&contenders, 4, |_, k| k != 0);
        assert_eq!(matrix.row(0), PortMask::one_hot(2));
        assert_eq!(matrix.row(1), PortMask::EMPTY);
        assert_eq!(matrix.row(2), PortMask::one_hot(2));
        assert_eq!(matrix.column(2), PortMask::from_bits(0b101));
    }

    #[test]
    fn test_partial_multicast_withdrawn() {
        let contenders = vec![multicast(0, 0b0101), unicast(1, 0)];
        let mut arbs = arbiters(4);
        // Output 2 is not ready
        let grants = arbitrate(&contenders, &mut arbs, |_, k| k != 2);
        assert_eq!(grants.withdrawn, 1);
        assert_eq!(grants.granted[0], PortMask::EMPTY);
        assert_eq!(grants.select[0], Some(1));
        assert_eq!(grants.select[2], None);
    }

    #[test]
    fn test_unicast_contention_one_winner() {
        let contenders = vec![unicast(0, 3), unicast(1, 3), unicast(2, 3)];
        let mut arbs = arbiters(4);
        let mut winners = Vec::new();
        for _ in 0..3 {
            let grants = arbitrate(&contenders, &mut arbs, |_, _| true);
            assert_eq!(grants.granted.iter().filter(|g| !g.is_empty()).count(), 1);
            winners.push(grants.select[3].unwrap());
        }
        assert_eq!(winners, vec![0, 1, 2]);
    }

    #[test]
    fn test_multicast_forced_on_all_destinations() {
        let contenders = vec![unicast(0, 2), multicast(1, 0b0101)];
        let mut arbs = arbiters(4);
        // Output 2 arbiter favours input 0, but input 1 won its leading leg (0)
        let grants = arbitrate(&contenders, &mut arbs, |_, _| true);
        assert_eq!(grants.granted[1], PortMask::from_bits(0b0101));
        assert_eq!(grants.granted[0], PortMask::EMPTY);
        assert_eq!(grants.voided, 0);
    }

    #[test]
    fn test_multicast_losing_leading_leg_releases_outputs() {
        let contenders = vec![unicast(0, 0), multicast(1, 0b0101)];
        let mut arbs = arbiters(4);
        let grants = arbitrate(&contenders, &mut arbs, |_, _| true);
        // Input 0 takes output 0; output 2 is released, not granted to input 1
        assert_eq!(grants.granted[0], PortMask::one_hot(0));
        assert_eq!(grants.granted[1], PortMask::EMPTY);
        assert_eq!(grants.select[2], None);

        // Rotation gives input 1 the leading leg next time
        let grants = arbitrate(&contenders, &mut arbs, |_, _| true);
        assert_eq!(grants.granted[1], PortMask::from_bits(0b0101));
    }

    #[test]
    fn test_overlapping_multicasts_void_second() {
        let contenders = vec![multicast(0, 0b0011), multicast(1, 0b0110)];
        let mut arbs = arbiters(4);
        // Give input 1 the priority on output 1 so both win their leading legs
        arbs[1].pick(PortMask::one_hot(0));
        let grants = arbitrate(&contenders, &mut arbs, |_, _| true);
        assert_eq!(grants.granted[0], PortMask::from_bits(0b0011));
        assert_eq!(grants.granted[1], PortMask::EMPTY);
        assert_eq!(grants.voided, 1);
        assert_eq!(grants.select[2], None);
    }

    #[test]
    fn test_lower_multicast_starves_overlapping_one() {
        // Input 0 leads on output 0 with no rival, so it always commits
        // before input 1 is looked at on output 1. Output 2 stays idle.
        let contenders = vec![multicast(0, 0b011), multicast(1, 0b110)];
        let mut arbs = arbiters(3);
        let mut voided = 0;
        for _ in 0..40 {
            let grants = arbitrate(&contenders, &mut arbs, |_, _| true);
            assert_eq!(grants.granted[0], PortMask::from_bits(0b011));
            assert_eq!(grants.granted[1], PortMask::EMPTY);
            assert_eq!(grants.select[2], None);
            voided += grants.voided;
        }
        // Input 1 wins output 1 every other round and is voided each time
        assert_eq!(voided, 20);
    }

    #[test]
    fn test_no_requests() {
        let contenders = vec![None, None];
        let mut arbs = arbiters(2);
        let grants = arbitrate(&contenders, &mut arbs, |_, _| true);
        assert!(grants.is_empty());
        assert_eq!(grants.select, vec![None, None]);
    }
}
