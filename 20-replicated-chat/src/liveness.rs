//! Local view of which nodes are down, and the primary rule derived from it.

/// One flag per configured node; `true` means presumed down.
///
/// Only the owning node mutates its vector, from its own observations. Views
/// are never exchanged, so two nodes may disagree after a partial partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    down: Vec<bool>,
}

impl Liveness {
    /// Every node starts presumed up.
    pub fn new(nodes: usize) -> Self {
        Self {
            down: vec![false; nodes],
        }
    }

    pub fn from_flags(down: Vec<bool>) -> Self {
        Self { down }
    }

    pub fn is_down(&self, id: usize) -> bool {
        self.down.get(id).copied().unwrap_or(true)
    }

    /// Marks `id` down. Returns whether the vector changed.
    pub fn mark_down(&mut self, id: usize) -> bool {
        match self.down.get_mut(id) {
            Some(flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    /// Lowest-indexed node not marked down.
    pub fn primary(&self) -> Option<usize> {
        self.down.iter().position(|down| !down)
    }

    pub fn is_primary(&self, id: usize) -> bool {
        self.primary() == Some(id)
    }

    /// Every live node except the primary, ascending.
    pub fn replicas(&self) -> Vec<usize> {
        let primary = self.primary();
        (0..self.down.len())
            .filter(|id| !self.down[*id] && Some(*id) != primary)
            .collect()
    }

    pub fn flags(&self) -> &[bool] {
        &self.down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_is_lowest_live_index() {
        let cases = [
            (vec![false, false, false], Some(0)),
            (vec![true, false, false], Some(1)),
            (vec![true, true, false], Some(2)),
            (vec![false, true, false], Some(0)),
            (vec![true, true, true], None),
        ];
        for (flags, expected) in cases {
            assert_eq!(Liveness::from_flags(flags.clone()).primary(), expected, "{flags:?}");
        }
    }

    #[test]
    fn identical_vectors_agree_on_primary() {
        let a = Liveness::from_flags(vec![true, false, true, false]);
        let b = a.clone();
        for id in 0..4 {
            assert_eq!(a.is_primary(id), b.is_primary(id));
        }
        assert!(a.is_primary(1));
        assert_eq!(a.replicas(), vec![3]);
    }

    #[test]
    fn mark_down_reports_changes_once() {
        let mut liveness = Liveness::new(3);
        assert!(liveness.mark_down(0));
        assert!(!liveness.mark_down(0));
        assert!(!liveness.mark_down(9));
        assert_eq!(liveness.flags(), &[true, false, false]);
        assert_eq!(liveness.primary(), Some(1));
        assert_eq!(liveness.replicas(), vec![2]);
        assert!(liveness.is_down(9));
    }
}
