//! Replica ack sets for quorum decisions.

use std::fmt;

use crate::utils::SectorlockError;

use fixedbitset::FixedBitSet;

/// Which replicas (by position in a resource's disk list) took part in one
/// I/O round.
#[derive(Clone, PartialEq, Eq)]
pub struct DiskSet(FixedBitSet);

impl DiskSet {
    /// An empty set over `size` replicas.
    pub fn empty(size: usize) -> Self {
        DiskSet(FixedBitSet::with_capacity(size))
    }

    /// A set built from per-replica outcomes, in disk order.
    pub fn from_acks(acks: impl IntoIterator<Item = bool>) -> Self {
        let acks: Vec<bool> = acks.into_iter().collect();
        let mut set = Self::empty(acks.len());
        for (d, ack) in acks.into_iter().enumerate() {
            set.0.set(d, ack);
        }
        set
    }

    #[inline]
    pub fn insert(&mut self, disk: usize) -> Result<(), SectorlockError> {
        if disk >= self.0.len() {
            return Err(SectorlockError::invalid(format!(
                "disk {} out of {}",
                disk,
                self.0.len()
            )));
        }
        self.0.insert(disk);
        Ok(())
    }

    #[inline]
    pub fn contains(&self, disk: usize) -> bool {
        self.0.contains(disk)
    }

    /// Number of replicas the set ranges over.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// Strictly more than half of the replicas. Exactly half of an even
    /// count is no quorum, and an empty set never is one.
    #[inline]
    pub fn is_majority(&self) -> bool {
        self.count() * 2 > self.size()
    }

    /// Replicas not in the set.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.0.len()).filter(move |i| !self.0.contains(*i))
    }
}

impl fmt::Debug for DiskSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let members: Vec<usize> = self.0.ones().collect();
        write!(f, "{}/{} {:?}", self.count(), self.size(), members)
    }
}

impl fmt::Display for DiskSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} of {}", self.count(), self.size())
    }
}
