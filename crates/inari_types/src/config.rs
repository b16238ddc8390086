/// Which server-table placement algorithm a node runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    #[default]
    Hopscotch,
    Cuckoo,
}

/// Which overlay maps keys to owning nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    #[default]
    Fixed,
    Chord,
}

/// Tuning knobs for a node and its clients. Defaults match the values the
/// system was measured with; every field can be overridden independently.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TuningParams {
    /// Bound on hopscotch displacement from the home slot. Must not exceed
    /// the bit width of the placement word.
    pub hop_range: u32,
    /// Table-size multiplier applied on resize.
    pub growth_factor: f64,
    /// Table slots at startup.
    pub initial_table_size: usize,
    /// Receive buffers a node keeps posted.
    pub msg_buffers: usize,
    /// Number of alternative hash seeds for a cuckoo table.
    pub hash_count: usize,
    /// Largest put payload sent inline; larger blobs are registered and
    /// fetched by the server with a one-sided read.
    pub inline_threshold: usize,
    /// Placement algorithm.
    pub table: TableKind,
    /// Overlay flavor.
    pub overlay: OverlayKind,
    /// Partition count for the fixed overlay.
    pub fixed_partitions: u16,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            hop_range: 32,
            growth_factor: 1.3,
            initial_table_size: 32,
            msg_buffers: 64,
            hash_count: 4,
            inline_threshold: 128,
            table: TableKind::default(),
            overlay: OverlayKind::default(),
            fixed_partitions: 1,
        }
    }
}

impl TuningParams {
    /// Next table size under the configured growth factor, always at least
    /// one slot larger so a resize makes progress.
    pub fn next_table_size(&self, current: usize) -> usize {
        ((current as f64 * self.growth_factor) as usize).max(current + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_range_fits_the_placement_word() {
        let params = TuningParams::default();
        assert!(params.hop_range <= u32::BITS);
    }

    #[test]
    fn growth_always_makes_progress() {
        let params = TuningParams {
            growth_factor: 1.0,
            ..Default::default()
        };
        assert!(params.next_table_size(1) > 1);
        assert_eq!(TuningParams::default().next_table_size(100), 130);
    }
}
