use std::time::Duration;

/// Parsed robots.txt rules for one user agent.
///
/// Longest-match wins between allow and disallow, with allow breaking ties.
/// Instances are cached per host for the duration of one crawl, never
/// process-wide.
#[derive(Debug, Default, Clone)]
pub struct RobotsTxt {
    allows: Vec<String>,
    disallows: Vec<String>,
    crawl_delay: Option<f64>,
}

impl RobotsTxt {
    /// Parse the rule groups that apply to `user_agent` (plus `*` groups).
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let agent_lower = user_agent.to_lowercase();

        let mut rules = RobotsTxt::default();
        let mut group_applies = false;
        let mut in_agent_line_run = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    // Consecutive user-agent lines share the following rules;
                    // a user-agent line after rules starts a fresh group.
                    if !in_agent_line_run {
                        group_applies = false;
                        in_agent_line_run = true;
                    }
                    let agent = value.to_lowercase();
                    if agent == "*" || agent_lower.contains(&agent) {
                        group_applies = true;
                    }
                }
                "disallow" if group_applies => {
                    in_agent_line_run = false;
                    if !value.is_empty() {
                        rules.disallows.push(value.to_string());
                    }
                }
                "allow" if group_applies => {
                    in_agent_line_run = false;
                    if !value.is_empty() {
                        rules.allows.push(value.to_string());
                    }
                }
                "crawl-delay" if group_applies => {
                    in_agent_line_run = false;
                    if let Ok(delay) = value.parse::<f64>() {
                        rules.crawl_delay = Some(delay);
                    }
                }
                _ => {
                    in_agent_line_run = false;
                }
            }
        }

        rules
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        let matched_allow = self
            .allows
            .iter()
            .filter(|rule| path.starts_with(rule.as_str()))
            .map(String::len)
            .max();
        let matched_disallow = self
            .disallows
            .iter()
            .filter(|rule| path.starts_with(rule.as_str()))
            .map(String::len)
            .max();

        match (matched_allow, matched_disallow) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(allow), Some(disallow)) => allow >= disallow,
        }
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay.map(Duration::from_secs_f64)
    }
}
