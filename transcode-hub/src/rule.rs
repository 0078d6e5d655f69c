use regex::Regex;

use crate::config::ConfigStore;
use crate::template::TemplateRegistry;

/// Binds `(app, stream)` identities to an ordered list of template names.
/// Globs support `*` and `?`, anchored at both ends.
#[derive(Debug, Clone)]
pub struct Rule {
    pub app_pattern: String,
    pub stream_pattern: String,
    pub templates: Vec<String>,
    pub auto_start: bool,
    /// Stored but not consulted for ordering; matching is first-match-wins
    /// in insertion order.
    pub priority: i32,
    app_regex: Regex,
    stream_regex: Regex,
}

impl Rule {
    pub fn new(app_pattern: &str, stream_pattern: &str, templates: Vec<String>) -> anyhow::Result<Self> {
        Ok(Self {
            app_pattern: app_pattern.to_string(),
            stream_pattern: stream_pattern.to_string(),
            templates,
            auto_start: true,
            priority: 0,
            app_regex: compile_glob(app_pattern)?,
            stream_regex: compile_glob(stream_pattern)?,
        })
    }

    pub fn matches(&self, app: &str, stream: &str) -> bool {
        self.app_regex.is_match(app) && self.stream_regex.is_match(stream)
    }
}

/// Compiles a glob into an anchored regex: `*` matches any run, `?` a single
/// character, everything else literally.
fn compile_glob(pattern: &str) -> anyhow::Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| anyhow::anyhow!("bad glob {:?}: {}", pattern, e))
}

/// Ordered rule list; insertion order is matching order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Builds the set from every `rules.<app glob>[/<stream glob>]` entry.
    /// A missing stream glob defaults to `*`; the value is a comma-separated
    /// template list. Rules without templates are dropped.
    pub fn parse(store: &ConfigStore) -> Self {
        let mut set = Self::default();
        for (pattern, value) in store.prefixed("rules.") {
            if pattern.is_empty() {
                continue;
            }
            let (app_pattern, stream_pattern) = match pattern.split_once('/') {
                Some((app, stream)) => (app, stream),
                None => (pattern, "*"),
            };

            let templates: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if templates.is_empty() {
                continue;
            }

            match Rule::new(app_pattern, stream_pattern, templates) {
                Ok(rule) => {
                    log::info!("loaded transcode rule: {} -> {}", pattern, value);
                    set.rules.push(rule);
                }
                Err(e) => log::warn!("skipping transcode rule {}: {}", pattern, e),
            }
        }
        set
    }

    pub fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Removes rules matching both patterns verbatim.
    pub fn remove(&mut self, app_pattern: &str, stream_pattern: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| !(r.app_pattern == app_pattern && r.stream_pattern == stream_pattern));
        self.rules.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Template names of the first rule matching `(app, stream)`, filtered to
    /// templates that exist in `registry`. Empty when nothing matches.
    pub fn matched_templates(&self, app: &str, stream: &str, registry: &TemplateRegistry) -> Vec<String> {
        for rule in &self.rules {
            if rule.matches(app, stream) {
                return rule
                    .templates
                    .iter()
                    .filter(|name| registry.contains(name))
                    .cloned()
                    .collect();
            }
        }
        Vec::new()
    }
}
