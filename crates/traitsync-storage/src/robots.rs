//! robots.txt policy evaluation.

use std::time::Duration;

use robotstxt::DefaultMatcher;
use tracing::debug;

/// Parsed robots policy for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotsPolicy {
    content: String,
    deny_all: bool,
}

impl RobotsPolicy {
    pub fn parse(content: &str) -> Self {
        Self {
            content: content.to_string(),
            deny_all: false,
        }
    }

    pub fn allow_all() -> Self {
        Self::parse("")
    }

    /// Fallback used when the policy document cannot be retrieved.
    pub fn conservative() -> Self {
        Self {
            content: String::new(),
            deny_all: true,
        }
    }

    pub fn is_conservative(&self) -> bool {
        self.deny_all
    }

    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        if self.deny_all {
            debug!(url, "conservative robots policy denies all paths");
            return false;
        }
        if self.content.trim().is_empty() {
            return true;
        }

        // Groups name the product token, not the full `name/version` string.
        let agent = user_agent.split('/').next().unwrap_or(user_agent).trim();
        let mut matcher = DefaultMatcher::default();
        let allowed = matcher.one_agent_allowed_by_robots(&self.content, agent, url);
        if !allowed {
            debug!(url, user_agent, "robots.txt disallows url");
        }
        allowed
    }

    /// `Crawl-delay` for the agent, preferring a specific group over `*`.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        let ua_lower = user_agent.to_ascii_lowercase();
        let mut current_agents: Vec<String> = Vec::new();
        let mut in_agent_lines = false;
        let mut default_delay = None;
        let mut specific_delay = None;

        for line in self.content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            if key == "user-agent" {
                if !in_agent_lines {
                    current_agents.clear();
                }
                current_agents.push(value.to_ascii_lowercase());
                in_agent_lines = true;
                continue;
            }
            in_agent_lines = false;

            if key != "crawl-delay" {
                continue;
            }
            let Ok(seconds) = value.parse::<f64>() else {
                continue;
            };
            if !seconds.is_finite() || seconds < 0.0 {
                continue;
            }
            let delay = Duration::from_secs_f64(seconds);
            for agent in &current_agents {
                if agent == "*" {
                    default_delay = Some(delay);
                } else if ua_lower.contains(agent.as_str()) {
                    specific_delay = Some(delay);
                }
            }
        }

        specific_delay.or(default_delay)
    }
}
