use smallvec::SmallVec;
use tracing::debug;

use crate::types::Mvccid;

const UNIT_BITS: u64 = u64::BITS as u64;
const ALL_COMPLETED: u64 = u64::MAX;
const INLINE_LONG_TX: usize = 8;

/// Sliding window of transaction states.
///
/// Bit `i` covers id `start_id + i`: 0 is active, 1 is completed. Ids past
/// the populated length are active. Active ids that fell out of the front of
/// the window live in `long_tx`, sorted and all below `start_id`.
#[derive(Clone, Debug)]
pub struct ActiveTxBitmap {
    units: Vec<u64>,
    start_id: Mvccid,
    bit_len: u64,
    long_tx: SmallVec<[Mvccid; INLINE_LONG_TX]>,
    high_water_units: usize,
}

impl ActiveTxBitmap {
    /// Empty window starting at `start_id`, with every id from there active.
    pub fn new(start_id: Mvccid, high_water_units: usize) -> Self {
        Self {
            units: Vec::new(),
            start_id,
            bit_len: 0,
            long_tx: SmallVec::new(),
            high_water_units: high_water_units.max(2),
        }
    }

    /// Forgets everything and restarts the window at `start_id`.
    pub fn reset(&mut self, start_id: Mvccid) {
        self.units.clear();
        self.long_tx.clear();
        self.start_id = start_id;
        self.bit_len = 0;
    }

    /// First id covered by the bit window.
    pub fn start_id(&self) -> Mvccid {
        self.start_id
    }

    /// Number of populated bits.
    pub fn len_bits(&self) -> u64 {
        self.bit_len
    }

    /// Still active ids older than the window, ascending.
    pub fn long_transactions(&self) -> &[Mvccid] {
        &self.long_tx
    }

    /// True unless `id` is known to have completed.
    pub fn is_active(&self, id: Mvccid) -> bool {
        if id < self.start_id {
            return self.long_tx.iter().any(|long| *long == id);
        }
        let pos = id.0 - self.start_id.0;
        if pos >= self.bit_len {
            return true;
        }
        self.units[(pos / UNIT_BITS) as usize] & (1u64 << (pos % UNIT_BITS)) == 0
    }

    /// Records that `id` committed or rolled back.
    pub fn set_inactive(&mut self, id: Mvccid) {
        if id < self.start_id {
            if let Ok(idx) = self.long_tx.binary_search(&id) {
                self.long_tx.remove(idx);
            }
            return;
        }
        let pos = id.0 - self.start_id.0;
        if pos >= self.bit_len {
            self.bit_len = pos + 1;
            let units = self.bit_len.div_ceil(UNIT_BITS) as usize;
            if units > self.units.len() {
                self.units.resize(units, 0);
            }
        }
        self.units[(pos / UNIT_BITS) as usize] |= 1u64 << (pos % UNIT_BITS);
        self.trim_completed_prefix();
        if self.units.len() > self.high_water_units {
            self.migrate_long_transactions();
        }
    }

    fn trim_completed_prefix(&mut self) {
        let full = self
            .units
            .iter()
            .take_while(|unit| **unit == ALL_COMPLETED)
            .count();
        if full > 0 {
            self.drop_front_units(full);
        }
    }

    // Moves the still active ids of every unit but the newest half into
    // `long_tx`, keeping it sorted since they are all newer than its contents.
    fn migrate_long_transactions(&mut self) {
        let keep = (self.high_water_units / 2).max(1);
        let moved = self.units.len() - keep;
        let before = self.long_tx.len();
        for (idx, unit) in self.units[..moved].iter().enumerate() {
            let mut active = !*unit;
            while active != 0 {
                let bit = active.trailing_zeros() as u64;
                self.long_tx
                    .push(Mvccid(self.start_id.0 + idx as u64 * UNIT_BITS + bit));
                active &= active - 1;
            }
        }
        self.drop_front_units(moved);
        debug!(
            moved_units = moved,
            long_tx = self.long_tx.len(),
            migrated = self.long_tx.len() - before,
            start_id = self.start_id.0,
            "mvcc.bitmap.migrate"
        );
    }

    fn drop_front_units(&mut self, count: usize) {
        self.units.drain(..count);
        self.start_id = Mvccid(self.start_id.0 + count as u64 * UNIT_BITS);
        self.bit_len -= count as u64 * UNIT_BITS;
    }

    /// Smallest id still active. `start_id + len` when everything tracked
    /// completed.
    pub fn compute_lowest_active(&self) -> Mvccid {
        if let Some(first) = self.long_tx.first() {
            return *first;
        }
        for (idx, unit) in self.units.iter().enumerate() {
            if *unit == ALL_COMPLETED {
                continue;
            }
            let pos = idx as u64 * UNIT_BITS + (!*unit).trailing_zeros() as u64;
            if pos < self.bit_len {
                return Mvccid(self.start_id.0 + pos);
            }
            break;
        }
        Mvccid(self.start_id.0 + self.bit_len)
    }

    /// Largest completed id, or `start_id - 1` when the window holds none.
    pub fn compute_highest_completed(&self) -> Mvccid {
        for (idx, unit) in self.units.iter().enumerate().rev() {
            if *unit != 0 {
                let bit = (UNIT_BITS - 1) - unit.leading_zeros() as u64;
                return Mvccid(self.start_id.0 + idx as u64 * UNIT_BITS + bit);
            }
        }
        self.start_id.prev()
    }

    /// Overwrites `dest` with this bitmap, dropping any longer previous content.
    pub fn copy_to(&self, dest: &mut ActiveTxBitmap) {
        dest.units.clear();
        dest.units.extend_from_slice(&self.units);
        dest.long_tx.clear();
        dest.long_tx.extend_from_slice(&self.long_tx);
        dest.start_id = self.start_id;
        dest.bit_len = self.bit_len;
        dest.high_water_units = self.high_water_units;
    }

    /// Checks the structural invariants; used by tests.
    pub fn check_invariants(&self) -> bool {
        let sorted = self.long_tx.windows(2).all(|w| w[0] < w[1]);
        let below = self.long_tx.iter().all(|id| *id < self.start_id);
        let units_match = self.units.len() as u64 == self.bit_len.div_ceil(UNIT_BITS);
        let tail_clear = match self.units.last() {
            Some(last) if self.bit_len % UNIT_BITS != 0 => {
                last >> (self.bit_len % UNIT_BITS) == 0
            }
            _ => true,
        };
        sorted && below && units_match && tail_clear
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_transaction_holds_lowest_active() {
        let mut bitmap = ActiveTxBitmap::new(Mvccid::FIRST, 16);
        for id in (1..=100).filter(|id| *id != 51) {
            bitmap.set_inactive(Mvccid(id));
        }
        assert_eq!(bitmap.compute_lowest_active(), Mvccid(51));
        assert!(bitmap.is_active(Mvccid(51)));
        assert!(!bitmap.is_active(Mvccid(50)));
        bitmap.set_inactive(Mvccid(51));
        assert_eq!(bitmap.compute_lowest_active(), Mvccid(101));
        assert_eq!(bitmap.compute_highest_completed(), Mvccid(100));
        assert!(bitmap.check_invariants());
    }

    #[test]
    fn full_units_are_trimmed() {
        let mut bitmap = ActiveTxBitmap::new(Mvccid::FIRST, 16);
        for id in 1..=64 {
            bitmap.set_inactive(Mvccid(id));
        }
        assert_eq!(bitmap.start_id(), Mvccid(65));
        assert_eq!(bitmap.len_bits(), 0);
        assert_eq!(bitmap.compute_highest_completed(), Mvccid(64));
        assert_eq!(bitmap.compute_lowest_active(), Mvccid(65));
    }

    #[test]
    fn window_past_high_water_migrates_active_ids() {
        let mut bitmap = ActiveTxBitmap::new(Mvccid::FIRST, 4);
        for id in 2..=400 {
            if id != 70 {
                bitmap.set_inactive(Mvccid(id));
            }
        }
        assert!(bitmap.long_transactions().contains(&Mvccid(1)));
        assert!(bitmap.long_transactions().contains(&Mvccid(70)));
        assert!(bitmap.check_invariants());
        assert_eq!(bitmap.compute_lowest_active(), Mvccid(1));
        bitmap.set_inactive(Mvccid(1));
        assert_eq!(bitmap.compute_lowest_active(), Mvccid(70));
        bitmap.set_inactive(Mvccid(70));
        assert!(bitmap.long_transactions().is_empty());
        assert_eq!(bitmap.compute_lowest_active(), Mvccid(401));
    }

    #[test]
    fn long_transactions_spill_past_inline_capacity() {
        let mut bitmap = ActiveTxBitmap::new(Mvccid::FIRST, 2);
        for id in (1..=300).filter(|id| id % 10 != 0) {
            bitmap.set_inactive(Mvccid(id));
        }
        assert!(bitmap.long_transactions().len() > INLINE_LONG_TX);
        assert!(bitmap.check_invariants());
        for id in (10..=300).step_by(10) {
            assert_eq!(bitmap.compute_lowest_active(), Mvccid(id));
            bitmap.set_inactive(Mvccid(id));
            assert!(bitmap.check_invariants());
        }
        assert!(bitmap.long_transactions().is_empty());
        assert_eq!(bitmap.compute_lowest_active(), Mvccid(301));
    }

    #[test]
    fn copy_to_overwrites_longer_destination() {
        let mut big = ActiveTxBitmap::new(Mvccid::FIRST, 16);
        for id in (1..300).step_by(2) {
            big.set_inactive(Mvccid(id));
        }
        let mut small = ActiveTxBitmap::new(Mvccid::FIRST, 16);
        small.set_inactive(Mvccid(2));
        small.copy_to(&mut big);
        assert_eq!(big.len_bits(), 2);
        assert!(big.is_active(Mvccid(3)));
        assert!(!big.is_active(Mvccid(2)));
        assert!(big.check_invariants());
    }
}
