use serde::{Deserialize, Serialize};

use crate::types::{HumanDuration, LateDataPolicy, WindowKind};

// ---------------------------------------------------------------------------
// WindowSection — deserialized from [window]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WindowSection {
    pub kind: WindowKind,
    pub size: HumanDuration,
    pub slide: Option<HumanDuration>,
    #[serde(default = "zero_duration")]
    pub allowed_lateness: HumanDuration,
    #[serde(default = "default_late_policy")]
    pub late_data_policy: LateDataPolicy,
}

fn zero_duration() -> HumanDuration {
    HumanDuration::from(std::time::Duration::ZERO)
}

fn default_late_policy() -> LateDataPolicy {
    LateDataPolicy::Drop
}

// ---------------------------------------------------------------------------
// WindowConfig — fully resolved window configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowConfig {
    pub kind: WindowKind,
    pub size: HumanDuration,
    /// Equal to `size` for tumbling windows.
    pub slide: HumanDuration,
    pub allowed_lateness: HumanDuration,
    pub late_data_policy: LateDataPolicy,
}

impl WindowSection {
    /// Resolve the section into a [`WindowConfig`], filling in `slide` for
    /// tumbling windows and checking sliding-window geometry.
    pub(crate) fn resolve(self) -> anyhow::Result<WindowConfig> {
        if self.size.is_zero() {
            anyhow::bail!("window.size must be > 0");
        }
        let slide = match (self.kind, self.slide) {
            (WindowKind::Tumbling, None) => self.size,
            (WindowKind::Tumbling, Some(slide)) if slide == self.size => slide,
            (WindowKind::Tumbling, Some(slide)) => anyhow::bail!(
                "window.slide ({slide}) is only valid for sliding windows (size = {})",
                self.size
            ),
            (WindowKind::Sliding, None) => {
                anyhow::bail!("window.slide is required when window.kind = \"sliding\"")
            }
            (WindowKind::Sliding, Some(slide)) => {
                if slide.is_zero() || slide > self.size {
                    anyhow::bail!(
                        "window.slide ({slide}) must be > 0 and <= window.size ({})",
                        self.size
                    );
                }
                slide
            }
        };

        Ok(WindowConfig {
            kind: self.kind,
            size: self.size,
            slide,
            allowed_lateness: self.allowed_lateness,
            late_data_policy: self.late_data_policy,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
