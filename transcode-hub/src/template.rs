use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::ConfigStore;

static SCALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"scale=(\d+):(\d+)").expect("scale regex"));

/// One named output variant: codec, bitrate, size and filter parameters for
/// a single encoder invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Template {
    pub name: String,
    pub video_codec: String,
    pub audio_codec: String,
    /// Extra video args not recognized by the parser, kept verbatim.
    pub video_params: String,
    pub audio_params: String,
    pub filter_params: String,
    /// kbps
    pub video_bitrate: u32,
    /// kbps
    pub audio_bitrate: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Template {
    /// A template is usable iff it has a name and at least one codec.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && (!self.video_codec.is_empty() || !self.audio_codec.is_empty())
    }

    /// Parses a whitespace-separated encoder argument string. Recognized
    /// tokens land in typed fields; everything else is preserved in
    /// `video_params`.
    pub fn parse(name: &str, params: &str) -> Self {
        let mut tmpl = Template { name: name.to_string(), ..Default::default() };

        let tokens: Vec<&str> = params.split_whitespace().collect();
        let mut i = 0;
        while i < tokens.len() {
            let has_value = i + 1 < tokens.len();
            match tokens[i] {
                "-vcodec" if has_value => {
                    i += 1;
                    tmpl.video_codec = tokens[i].to_string();
                }
                "-acodec" if has_value => {
                    i += 1;
                    tmpl.audio_codec = tokens[i].to_string();
                }
                "-b:v" if has_value => {
                    i += 1;
                    tmpl.video_bitrate = parse_kbps(tokens[i]);
                }
                "-b:a" if has_value => {
                    i += 1;
                    tmpl.audio_bitrate = parse_kbps(tokens[i]);
                }
                "-r" if has_value => {
                    i += 1;
                    tmpl.fps = tokens[i].parse().unwrap_or(0);
                }
                "-vf" if has_value => {
                    i += 1;
                    let vf = tokens[i];
                    if let Some(caps) = SCALE_RE.captures(vf) {
                        tmpl.width = caps[1].parse().unwrap_or(0);
                        tmpl.height = caps[2].parse().unwrap_or(0);
                    }
                    push_arg(&mut tmpl.filter_params, "-vf");
                    push_arg(&mut tmpl.filter_params, vf);
                }
                other => {
                    push_arg(&mut tmpl.video_params, other);
                }
            }
            i += 1;
        }

        tmpl
    }

    /// Renders the encoder arguments in fixed order: video codec, video
    /// bitrate, frame rate, extra video args, audio codec, audio bitrate,
    /// extra audio args, filter args.
    pub fn render(&self) -> Vec<String> {
        let mut args = Vec::new();

        if !self.video_codec.is_empty() {
            args.push("-vcodec".to_string());
            args.push(self.video_codec.clone());
            if self.video_bitrate > 0 {
                args.push("-b:v".to_string());
                args.push(format!("{}k", self.video_bitrate));
            }
            if self.fps > 0 {
                args.push("-r".to_string());
                args.push(self.fps.to_string());
            }
            args.extend(self.video_params.split_whitespace().map(str::to_string));
        }

        if !self.audio_codec.is_empty() {
            args.push("-acodec".to_string());
            args.push(self.audio_codec.clone());
            if self.audio_bitrate > 0 {
                args.push("-b:a".to_string());
                args.push(format!("{}k", self.audio_bitrate));
            }
            args.extend(self.audio_params.split_whitespace().map(str::to_string));
        }

        args.extend(self.filter_params.split_whitespace().map(str::to_string));

        args
    }
}

fn parse_kbps(token: &str) -> u32 {
    token.trim_end_matches(['k', 'K']).parse().unwrap_or(0)
}

fn push_arg(buf: &mut String, arg: &str) {
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(arg);
}

/// Named templates, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Template>,
}

impl TemplateRegistry {
    /// Builds the registry from every `templates.<name>` entry. Invalid
    /// templates are logged and skipped.
    pub fn parse(store: &ConfigStore) -> Self {
        let mut registry = Self::default();
        for (name, params) in store.prefixed("templates.") {
            if name.is_empty() {
                continue;
            }
            let tmpl = Template::parse(name, params);
            if tmpl.is_valid() {
                log::info!("loaded transcode template: {}", name);
                registry.templates.insert(name.to_string(), tmpl);
            } else {
                log::warn!("invalid transcode template: {}", name);
            }
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    pub fn add(&mut self, tmpl: Template) -> bool {
        if !tmpl.is_valid() {
            return false;
        }
        self.templates.insert(tmpl.name.clone(), tmpl);
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.templates.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
