// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

/// One `User-agent` block.
#[derive(Debug, Clone, Default)]
struct RuleGroup {
    agents: Vec<String>,
    /// `(allow, path_prefix)` in file order.
    rules: Vec<(bool, String)>,
    crawl_delay: Option<Duration>,
}

/// Parsed site exclusion directives.
///
/// Matching follows the common convention: the group for the most specific
/// matching agent applies, within a group the longest matching prefix rule
/// wins, allow beats disallow on equal length, and anything unmatched is
/// allowed.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    groups: Vec<RuleGroup>,
}

impl RobotsRules {
    pub fn parse(text: &str) -> Self {
        let mut groups: Vec<RuleGroup> = Vec::new();
        let mut current: Option<RuleGroup> = None;
        // `User-agent` lines stack until a rule line closes the header run.
        let mut agent_run = false;

        for line in text.lines() {
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !agent_run {
                        if let Some(done) = current.take() {
                            groups.push(done);
                        }
                        current = Some(RuleGroup::default());
                    }
                    if let Some(group) = current.as_mut() {
                        group.agents.push(value.to_ascii_lowercase());
                    }
                    agent_run = true;
                },
                "disallow" | "allow" => {
                    agent_run = false;
                    if let Some(group) = current.as_mut() {
                        if !value.is_empty() {
                            group.rules.push((key == "allow", value.to_string()));
                        }
                    }
                },
                "crawl-delay" => {
                    agent_run = false;
                    if let Some(group) = current.as_mut() {
                        group.crawl_delay = value
                            .parse::<f64>()
                            .ok()
                            .filter(|s| *s >= 0.0)
                            .map(Duration::from_secs_f64);
                    }
                },
                _ => {
                    agent_run = false;
                },
            }
        }
        if let Some(done) = current.take() {
            groups.push(done);
        }
        Self { groups }
    }

    fn group_for(&self, agent: &str) -> Option<&RuleGroup> {
        let agent = agent.to_ascii_lowercase();
        self.groups
            .iter()
            .find(|g| g.agents.iter().any(|a| a != "*" && agent.contains(a)))
            .or_else(|| {
                self.groups
                    .iter()
                    .find(|g| g.agents.iter().any(|a| a == "*"))
            })
    }

    pub fn is_allowed(&self, agent: &str, path: &str) -> bool {
        let Some(group) = self.group_for(agent) else {
            return true;
        };
        let mut verdict = true;
        let mut best_len = 0;
        for (allow, prefix) in &group.rules {
            if path.starts_with(prefix.as_str()) {
                let len = prefix.len();
                if len > best_len || (len == best_len && *allow) {
                    best_len = len;
                    verdict = *allow;
                }
            }
        }
        verdict
    }

    pub fn crawl_delay(&self, agent: &str) -> Option<Duration> {
        self.group_for(agent).and_then(|g| g.crawl_delay)
    }
}
