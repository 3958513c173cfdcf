/// Selection of frame rows, e.g. the rows that receive results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMask {
    bits: Vec<bool>,
}

impl RowMask {
    pub fn all(n_rows: usize) -> Self {
        Self { bits: vec![true; n_rows] }
    }

    pub fn none(n_rows: usize) -> Self {
        Self { bits: vec![false; n_rows] }
    }

    pub fn from_fn(n_rows: usize, f: impl FnMut(usize) -> bool) -> Self {
        Self {
            bits: (0..n_rows).map(f).collect(),
        }
    }

    #[inline]
    pub fn contains(&self, row: usize) -> bool {
        self.bits.get(row).copied().unwrap_or(false)
    }

    pub fn set(&mut self, row: usize, selected: bool) {
        if let Some(bit) = self.bits.get_mut(row) {
            *bit = selected;
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of selected rows.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Indices of selected rows in ascending order.
    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().filter(|(_, b)| **b).map(|(i, _)| i)
    }
}
