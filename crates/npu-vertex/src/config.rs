// SPDX-License-Identifier: AGPL-3.0-only

//! Vertex configuration
//!
//! Defaults match the production driver. Each field can be overridden from
//! the environment with [`VertexConfig::from_env`].

use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable for [`VertexConfig::streamoff_delay_on_emergency`] (ms)
pub const ENV_STREAMOFF_DELAY_MS: &str = "NPU_STREAMOFF_DELAY_MS";
/// Environment variable for [`VertexConfig::boost_timeout`] (ms)
pub const ENV_BOOST_TIMEOUT_MS: &str = "NPU_BOOST_TIMEOUT_MS";
/// Environment variable for [`VertexConfig::fm_shared_slack`]
pub const ENV_FM_SHARED_SLACK: &str = "NPU_FM_SHARED_SLACK";
/// Environment variable for [`VertexConfig::dsp_via_vertex`]
pub const ENV_DSP_VIA_VERTEX: &str = "NPU_DSP_VIA_VERTEX";

/// Tunables for a vertex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexConfig {
    /// Settle time used in place of the stream-off command during a forced
    /// streamoff while the emergency flag is latched
    pub streamoff_delay_on_emergency: Duration,

    /// Deferred deboost timeout handed to the scheduler
    pub boost_timeout: Duration,

    /// Extra feature-map entries a format list may carry beyond the graph's count
    pub fm_shared_slack: u32,

    /// Allow bootup to claim the DSP-only hardware id
    pub dsp_via_vertex: bool,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            streamoff_delay_on_emergency: Duration::from_millis(500),
            boost_timeout: Duration::from_millis(100),
            fm_shared_slack: 1,
            dsp_via_vertex: false,
        }
    }
}

impl VertexConfig {
    /// Defaults overridden by any `NPU_*` environment variables that are set
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>(ENV_STREAMOFF_DELAY_MS) {
            config.streamoff_delay_on_emergency = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>(ENV_BOOST_TIMEOUT_MS) {
            config.boost_timeout = Duration::from_millis(ms);
        }
        if let Some(slack) = env_parse::<u32>(ENV_FM_SHARED_SLACK) {
            config.fm_shared_slack = slack;
        }
        if let Some(dsp) = env_parse::<bool>(ENV_DSP_VIA_VERTEX) {
            config.dsp_via_vertex = dsp;
        }

        debug!("Vertex config: {config:?}");
        config
    }

    /// Set the emergency streamoff delay
    #[must_use]
    pub const fn with_streamoff_delay(mut self, delay: Duration) -> Self {
        self.streamoff_delay_on_emergency = delay;
        self
    }

    /// Set the deboost timeout
    #[must_use]
    pub const fn with_boost_timeout(mut self, timeout: Duration) -> Self {
        self.boost_timeout = timeout;
        self
    }

    /// Set the feature-map slack
    #[must_use]
    pub const fn with_fm_shared_slack(mut self, slack: u32) -> Self {
        self.fm_shared_slack = slack;
        self
    }

    /// Allow or refuse DSP-only bootup
    #[must_use]
    pub const fn with_dsp_via_vertex(mut self, enabled: bool) -> Self {
        self.dsp_via_vertex = enabled;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = VertexConfig::default();
        assert_eq!(c.streamoff_delay_on_emergency, Duration::from_millis(500));
        assert_eq!(c.boost_timeout, Duration::from_millis(100));
        assert_eq!(c.fm_shared_slack, 1);
        assert!(!c.dsp_via_vertex);
    }

    #[test]
    fn builders_override() {
        let c = VertexConfig::default()
            .with_streamoff_delay(Duration::from_millis(1))
            .with_boost_timeout(Duration::ZERO)
            .with_fm_shared_slack(3)
            .with_dsp_via_vertex(true);
        assert_eq!(c.streamoff_delay_on_emergency, Duration::from_millis(1));
        assert_eq!(c.boost_timeout, Duration::ZERO);
        assert_eq!(c.fm_shared_slack, 3);
        assert!(c.dsp_via_vertex);
    }

    #[test]
    fn unparseable_env_value_is_ignored() {
        std::env::set_var("NPU_TEST_ONLY_SLACK", "lots");
        assert_eq!(env_parse::<u32>("NPU_TEST_ONLY_SLACK"), None);
        std::env::set_var("NPU_TEST_ONLY_SLACK", " 4 ");
        assert_eq!(env_parse::<u32>("NPU_TEST_ONLY_SLACK"), Some(4));
        std::env::remove_var("NPU_TEST_ONLY_SLACK");
    }
}
