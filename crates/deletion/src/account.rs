//! Per-user state read by the click handler: session, active mode, counters.

use serde::{Deserialize, Serialize};
use streaming::ClickMode;

/// Remaining deletion charges, as reported by the user's profile.
///
/// Deserializes straight from the profile JSON (`clicksTotal`,
/// `clicksUsed`, `superClicksTotal`, `ultraClicksTotal`); other profile
/// fields are ignored and missing counters read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceCounters {
    pub clicks_total: u64,
    pub clicks_used: u64,
    pub super_clicks_total: u64,
    pub ultra_clicks_total: u64,
}

impl ResourceCounters {
    pub fn available(&self, mode: ClickMode) -> u64 {
        match mode {
            ClickMode::Single => self.clicks_total,
            ClickMode::Super => self.super_clicks_total,
            ClickMode::Ultra => self.ultra_clicks_total,
        }
    }

    /// Spend one charge for `mode`, however many cells it affected.
    pub fn charge(&mut self, mode: ClickMode) {
        match mode {
            ClickMode::Single => {
                self.clicks_total = self.clicks_total.saturating_sub(1);
                self.clicks_used += 1;
            }
            ClickMode::Super => self.super_clicks_total = self.super_clicks_total.saturating_sub(1),
            ClickMode::Ultra => self.ultra_clicks_total = self.ultra_clicks_total.saturating_sub(1),
        }
    }
}

/// Typed state container for the click handler.
///
/// Exactly one mode is active at a time; `Single` is the resting mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    token: Option<String>,
    mode: ClickMode,
    counters: ResourceCounters,
}

impl Account {
    pub fn new(token: Option<String>, counters: ResourceCounters) -> Self {
        Self {
            token,
            mode: ClickMode::Single,
            counters,
        }
    }

    pub fn sign_in(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    pub fn sign_out(&mut self) {
        self.token = None;
        self.mode = ClickMode::Single;
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn mode(&self) -> ClickMode {
        self.mode
    }

    /// Enable `mode`, disabling whichever batch mode was on.
    pub fn enable(&mut self, mode: ClickMode) {
        self.mode = mode;
    }

    /// Flip a batch mode on or off; toggling the active mode returns to
    /// `Single`.
    pub fn toggle(&mut self, mode: ClickMode) -> ClickMode {
        self.mode = if self.mode == mode {
            ClickMode::Single
        } else {
            mode
        };
        self.mode
    }

    pub fn counters(&self) -> ResourceCounters {
        self.counters
    }

    pub fn set_counters(&mut self, counters: ResourceCounters) {
        self.counters = counters;
    }

    /// Record a confirmed deletion made in `mode`. Batch modes switch
    /// themselves off after one use.
    pub fn charge(&mut self, mode: ClickMode) {
        self.counters.charge(mode);
        if mode.is_batch() && self.mode == mode {
            self.mode = ClickMode::Single;
        }
    }
}
