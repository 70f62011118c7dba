//! Colors for CLI output.
//!
//! Colors are off when `--no-color` is given or `NO_COLOR` is set. Every
//! helper here returns unstyled output in that case.

use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::OwoColorize;

use crate::pool::protocol::PoolHealth;

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally, for owo_colors text and table cells alike.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Semantic color categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantic {
    Healthy,
    Starting,
    Offline,
    /// Slot numbers.
    Slot,
    /// Counters.
    Count,
    Muted,
}

impl From<PoolHealth> for Semantic {
    fn from(health: PoolHealth) -> Self {
        match health {
            PoolHealth::Healthy => Self::Healthy,
            PoolHealth::Starting => Self::Starting,
            PoolHealth::Offline => Self::Offline,
            PoolHealth::Unknown => Self::Muted,
        }
    }
}

/// comfy_table color for a category; `None` leaves the cell unstyled.
pub fn table_color(semantic: Semantic) -> Option<comfy_table::Color> {
    if !colors_enabled() {
        return None;
    }
    Some(match semantic {
        Semantic::Healthy => comfy_table::Color::Green,
        Semantic::Starting => comfy_table::Color::Yellow,
        Semantic::Offline => comfy_table::Color::Red,
        Semantic::Slot => comfy_table::Color::Cyan,
        Semantic::Count => comfy_table::Color::Reset,
        Semantic::Muted => comfy_table::Color::DarkGrey,
    })
}

/// Extension trait for comfy_table cells with NO_COLOR support.
pub trait ThemedCell {
    fn themed(self, semantic: Semantic) -> Self;
}

impl ThemedCell for comfy_table::Cell {
    fn themed(self, semantic: Semantic) -> Self {
        match table_color(semantic) {
            Some(color) => self.fg(color),
            None => self,
        }
    }
}

/// Semantic styles for terminal text.
pub trait Themed: OwoColorize + std::fmt::Display {
    /// Pool health, colored by state.
    fn health(&self, health: PoolHealth) -> String {
        if !colors_enabled() {
            return self.to_string();
        }
        match health {
            PoolHealth::Healthy => self.green().bold().to_string(),
            PoolHealth::Starting => self.yellow().to_string(),
            PoolHealth::Offline => self.red().bold().to_string(),
            PoolHealth::Unknown => self.dimmed().to_string(),
        }
    }

    /// Style for success messages (green + bold).
    fn success(&self) -> String {
        if colors_enabled() {
            self.green().bold().to_string()
        } else {
            self.to_string()
        }
    }

    /// Style for secondary text (dimmed).
    fn muted(&self) -> String {
        if colors_enabled() {
            self.dimmed().to_string()
        } else {
            self.to_string()
        }
    }
}

impl<T: OwoColorize + std::fmt::Display> Themed for T {}
