//! Crossbar traversal and egress staging.
//!
//! The crossbar copies each granted input's flit to its outputs. Copies
//! land in a small per-output staging FIFO that drains one flit per tick
//! into the egress channel. A flit the egress channel refuses stays at the
//! head of staging and is offered again, unchanged, on the next tick.

use super::channel::Channel;
use super::flit::Flit;
use super::RouterError;

/// Route `inputs` to outputs according to `select`.
///
/// `select[k]` names the input feeding output `k`. Outputs with no
/// selection, or a selection pointing at an idle input, get `None`.
pub fn traverse<T: Clone>(inputs: &[Option<T>], select: &[Option<usize>]) -> Vec<Option<T>> {
    select
        .iter()
        .map(|sel| sel.and_then(|i| inputs.get(i).cloned().flatten()))
        .collect()
}

/// Result of draining one staging slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Nothing staged
    Idle,
    /// Flit pushed to the egress channel
    Sent(Flit),
    /// Egress channel full; flit kept for the next tick
    Blocked,
}

/// Per-output staging FIFOs.
#[derive(Debug, Clone)]
pub struct EgressStage {
    slots: Vec<Channel<Flit>>,
}

impl EgressStage {
    pub fn new(num_ports: usize, depth: usize) -> Self {
        Self {
            slots: (0..num_ports).map(|_| Channel::new(depth)).collect(),
        }
    }

    pub fn push(&mut self, port: usize, flit: Flit) -> Result<(), RouterError> {
        if self.slots[port].try_push(flit).is_err() {
            log::warn!("Egress staging overflow on port {}", port);
            return Err(RouterError::StagingOverflow { port });
        }
        Ok(())
    }

    pub fn free_slots(&self, port: usize) -> usize {
        self.slots[port].free_slots()
    }

    pub fn len(&self, port: usize) -> usize {
        self.slots[port].len()
    }

    /// Staged flits on `port` belonging to `vc`.
    pub fn count_vc(&self, port: usize, vc: usize, num_vcs: usize) -> usize {
        self.slots[port]
            .iter()
            .filter(|f| f.virtual_channel(num_vcs) == vc)
            .count()
    }

    pub fn total_len(&self) -> usize {
        self.slots.iter().map(Channel::len).sum()
    }

    /// Offer the oldest staged flit on `port` to `egress`.
    pub fn drain(&mut self, port: usize, egress: &mut Channel<Flit>) -> Drain {
        let Some(&flit) = self.slots[port].peek() else {
            return Drain::Idle;
        };
        match egress.try_push(flit) {
            Ok(()) => {
                self.slots[port].try_pop();
                Drain::Sent(flit)
            }
            Err(_) => Drain::Blocked,
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(Channel::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traverse_unicast_and_multicast() {
        let inputs = vec![Some('a'), None, Some('c')];
        let select = vec![Some(2), None, Some(0), Some(2), Some(1)];
        assert_eq!(traverse(&inputs, &select), vec![Some('c'), None, Some('a'), Some('c'), None]);
    }

    #[test]
    fn test_traverse_no_stale_outputs() {
        let select = vec![None; 3];
        assert_eq!(traverse(&[Some(1u8), Some(2)], &select), vec![None, None, None]);
    }

    #[test]
    fn test_drain_reoffers_verbatim() {
        let mut stage = EgressStage::new(2, 1);
        let mut egress = Channel::new(1);
        let flit = Flit::head(0xBEEF, 3);

        stage.push(1, flit).unwrap();
        assert_eq!(stage.free_slots(1), 0);
        assert!(stage.push(1, flit).is_err());

        egress.try_push(Flit::single(0, 0)).unwrap();
        assert_eq!(stage.drain(1, &mut egress), Drain::Blocked);
        assert_eq!(stage.len(1), 1);

        egress.try_pop();
        assert_eq!(stage.drain(1, &mut egress), Drain::Sent(flit));
        assert_eq!(egress.try_pop(), Some(flit));
        assert_eq!(stage.drain(1, &mut egress), Drain::Idle);
        assert_eq!(stage.drain(0, &mut egress), Drain::Idle);
    }

    #[test]
    fn test_count_vc() {
        let mut stage = EgressStage::new(1, 4);
        stage.push(0, Flit::body(0, 0b01)).unwrap();
        stage.push(0, Flit::body(0, 0b11)).unwrap();
        stage.push(0, Flit::body(0, 0b10)).unwrap();
        assert_eq!(stage.count_vc(0, 1, 2), 2);
        assert_eq!(stage.count_vc(0, 0, 2), 1);
        assert_eq!(stage.total_len(), 3);
    }
}
