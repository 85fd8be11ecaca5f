//! Registry of monitored compost systems and kill-cycle streak arithmetic.

/// The nine probe positions in walking order.
pub static STANDARD_PROBES: [&str; 9] = [
    "Core Centre",
    "Core Left",
    "Core Right",
    "Mid Centre",
    "Mid Left",
    "Mid Right",
    "Edge Centre",
    "Edge Left",
    "Edge Right",
];

pub const DEFAULT_PROBE_COUNT: usize = 9;

/// Kill cycle: peak at or above 131°F for 3 consecutive days
pub const KILL_TEMP_F: f64 = 131.0;
pub const KILL_DAYS_REQUIRED: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct CompostSystem {
    pub id: &'static str,
    pub name: &'static str,
    pub short_name: &'static str,
    /// Spreadsheet tab the system's rows are appended to
    pub sheet_tab: &'static str,
    pub active: bool,
    pub probe_count: usize,
}

impl CompostSystem {
    const fn standard(
        id: &'static str,
        name: &'static str,
        short_name: &'static str,
        probe_count: usize,
    ) -> Self {
        Self {
            id,
            name,
            short_name,
            sheet_tab: name,
            active: true,
            probe_count,
        }
    }

    const fn with_sheet_tab(mut self, sheet_tab: &'static str) -> Self {
        self.sheet_tab = sheet_tab;
        self
    }

    pub fn probe_labels(&self) -> &'static [&'static str] {
        &STANDARD_PROBES[..self.probe_count.min(STANDARD_PROBES.len())]
    }
}

pub static COMPOST_SYSTEMS: [CompostSystem; 11] = [
    CompostSystem::standard("pivot-1", "Pivot #1", "P1", DEFAULT_PROBE_COUNT),
    CompostSystem::standard("pivot-2", "Pivot #2", "P2", DEFAULT_PROBE_COUNT),
    CompostSystem::standard("pivot-3", "Pivot #3", "P3", DEFAULT_PROBE_COUNT),
    CompostSystem::standard("pivot-4", "Pivot #4", "P4", DEFAULT_PROBE_COUNT),
    CompostSystem::standard(
        "carbon-cube-2",
        "Carbon Cube Cycle 2",
        "CC2",
        DEFAULT_PROBE_COUNT,
    ),
    CompostSystem::standard("cylinder-1", "Cylinder #1", "C1", 5),
    CompostSystem::standard("cylinder-2", "Cylinder #2", "C2", 5),
    CompostSystem::standard("cylinder-3", "Cylinder #3", "C3", 5),
    // the remote tab name carries a trailing space
    CompostSystem::standard("batch-1", "Batch 1", "B1", DEFAULT_PROBE_COUNT).with_sheet_tab("Batch 1 "),
    CompostSystem::standard("batch-2", "Batch 2", "B2", DEFAULT_PROBE_COUNT),
    CompostSystem::standard("batch-3", "Batch 3", "B3", DEFAULT_PROBE_COUNT),
];

pub fn system_by_id(id: &str) -> Option<&'static CompostSystem> {
    COMPOST_SYSTEMS.iter().find(|s| s.id == id)
}

/// Tab name for a system, falling back to the raw id for unknown systems.
pub fn sheet_tab_for(system_id: &str) -> &str {
    system_by_id(system_id)
        .map(|s| s.sheet_tab)
        .unwrap_or(system_id)
}

pub fn probe_count_for(system_id: &str) -> usize {
    system_by_id(system_id)
        .map(|s| s.probe_count)
        .unwrap_or(DEFAULT_PROBE_COUNT)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillStreaks {
    /// Consecutive qualifying days counted back from the most recent
    pub current: u32,
    pub longest: u32,
}

impl KillStreaks {
    pub fn is_complete(&self) -> bool {
        self.current >= KILL_DAYS_REQUIRED
    }
}

/// Streaks over daily peaks ordered oldest to newest.
pub fn kill_streaks(peaks: &[Option<f64>]) -> KillStreaks {
    let qualifies = |peak: &Option<f64>| matches!(peak, Some(p) if *p >= KILL_TEMP_F);

    let current = peaks.iter().rev().take_while(|p| qualifies(*p)).count() as u32;

    let mut longest = 0;
    let mut running = 0;
    for peak in peaks {
        if qualifies(peak) {
            running += 1;
            longest = longest.max(running);
        } else {
            running = 0;
        }
    }

    KillStreaks { current, longest }
}
