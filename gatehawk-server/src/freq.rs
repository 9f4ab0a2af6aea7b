use serde::{Deserialize, Serialize};

/// Frequency slot with value 0 meaning "node disabled".
pub const FREQUENCY_NONE: u32 = 0;

/// Per-node frequency assignments of a profile, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencySet {
    /// Band letter per node (None for custom/disabled).
    pub b: Vec<Option<String>>,
    /// Channel number per node.
    pub c: Vec<Option<u16>>,
    /// Frequency in MHz per node; 0 disables the node.
    pub f: Vec<u32>,
}

impl FrequencySet {
    pub fn empty(node_count: usize) -> Self {
        Self {
            b: vec![None; node_count],
            c: vec![None; node_count],
            f: vec![FREQUENCY_NONE; node_count],
        }
    }

    /// Default assignment: Raceband 1/3/6/7 up to four nodes, IMD6C beyond.
    pub fn defaults(node_count: usize) -> Self {
        let preset = if node_count < 5 {
            preset("RB-4").expect("builtin preset")
        } else {
            preset("IMD6C").expect("builtin preset")
        };
        let mut set = preset;
        set.resize(node_count);
        set
    }

    /// Grow or shrink to the node count; new slots are disabled.
    pub fn resize(&mut self, node_count: usize) {
        self.b.resize(node_count, None);
        self.c.resize(node_count, None);
        self.f.resize(node_count, FREQUENCY_NONE);
    }

    pub fn len(&self) -> usize {
        self.f.len()
    }

    pub fn is_empty(&self) -> bool {
        self.f.is_empty()
    }

    pub fn set_slot(&mut self, node: usize, band: Option<String>, channel: Option<u16>, freq: u32) {
        if node >= self.len() {
            self.resize(node + 1);
        }
        self.b[node] = band;
        self.c[node] = channel;
        self.f[node] = freq;
    }

    /// Copy slot 0 across every slot (the `All-N1` preset).
    pub fn all_to_first(&mut self) {
        let band = self.b.first().cloned().flatten();
        let chan = self.c.first().copied().flatten();
        let freq = self.f.first().copied().unwrap_or(FREQUENCY_NONE);
        for idx in 0..self.len() {
            self.b[idx] = band.clone();
            self.c[idx] = chan;
            self.f[idx] = freq;
        }
    }
}

/// Per-node enter/exit threshold overrides of a profile, stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelSet {
    pub v: Vec<Option<i64>>,
}

impl LevelSet {
    pub fn empty(node_count: usize) -> Self {
        Self {
            v: vec![None; node_count],
        }
    }

    pub fn set(&mut self, node: usize, level: i64) {
        if node >= self.v.len() {
            self.v.resize(node + 1, None);
        }
        self.v[node] = Some(level);
    }

    pub fn get(&self, node: usize) -> Option<i64> {
        self.v.get(node).copied().flatten()
    }
}

/// Fixed preset tables. `All-N1` is not listed here: it copies slot 0 and is
/// applied against the active profile by the caller.
pub fn preset(name: &str) -> Option<FrequencySet> {
    let (bands, channels, freqs): (&[&str], &[u16], &[u32]) = match name {
        "RB-4" => (&["R", "R", "R", "R"], &[1, 3, 6, 7], &[5658, 5732, 5843, 5880]),
        "RB-8" => (
            &["R", "R", "R", "R", "R", "R", "R", "R"],
            &[1, 2, 3, 4, 5, 6, 7, 8],
            &[5658, 5695, 5732, 5769, 5806, 5843, 5880, 5917],
        ),
        "IMD5C" => (
            &["R", "R", "F", "F", "E"],
            &[1, 2, 2, 4, 5],
            &[5658, 5695, 5760, 5800, 5885],
        ),
        "IMD6C" => (
            &["R", "R", "F", "F", "R", "R"],
            &[1, 2, 2, 4, 7, 8],
            &[5658, 5695, 5760, 5800, 5880, 5917],
        ),
        _ => return None,
    };

    Some(FrequencySet {
        b: bands.iter().map(|b| Some(b.to_string())).collect(),
        c: channels.iter().map(|c| Some(*c)).collect(),
        f: freqs.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_tables_match_published_values() {
        let rb4 = preset("RB-4").unwrap();
        assert_eq!(rb4.f, vec![5658, 5732, 5843, 5880]);

        let rb8 = preset("RB-8").unwrap();
        assert_eq!(rb8.f.len(), 8);
        assert_eq!(rb8.f[7], 5917);

        let imd5c = preset("IMD5C").unwrap();
        assert_eq!(imd5c.f, vec![5658, 5695, 5760, 5800, 5885]);

        let imd6c = preset("IMD6C").unwrap();
        assert_eq!(imd6c.f, vec![5658, 5695, 5760, 5800, 5880, 5917]);

        assert!(preset("nope").is_none());
    }

    #[test]
    fn resize_pads_with_disabled_slots() {
        let mut set = preset("RB-4").unwrap();
        set.resize(6);
        assert_eq!(set.f[4], FREQUENCY_NONE);
        assert_eq!(set.b[5], None);

        set.resize(2);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn all_to_first_copies_slot_zero() {
        let mut set = preset("IMD6C").unwrap();
        set.all_to_first();
        assert!(set.f.iter().all(|&f| f == 5658));
        assert!(set.c.iter().all(|&c| c == Some(1)));
    }

    #[test]
    fn frequency_set_round_trips_as_json() {
        let set = FrequencySet::defaults(4);
        let json = serde_json::to_string(&set).unwrap();
        let back: FrequencySet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }
}
