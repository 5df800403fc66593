/// Separator and sanitization rules differ per transport: bus-style paths
/// use `/`, key/value store keys use `:`, event-log topics use `-` with a
/// `.health` suffix for health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Bus,
    Kv,
    Log,
}

impl PathStyle {
    fn sep(self) -> char {
        match self {
            PathStyle::Bus => '/',
            PathStyle::Kv => ':',
            PathStyle::Log => '-',
        }
    }
}

/// Turns abstract resources into transport-specific topic/key strings.
#[derive(Debug, Clone)]
pub struct Namespace {
    namespace: String,
    selector: Option<String>,
    style: PathStyle,
}

impl Namespace {
    pub fn new(namespace: impl Into<String>, selector: Option<String>, style: PathStyle) -> Self {
        Namespace {
            namespace: namespace.into(),
            selector,
            style,
        }
    }

    pub fn style(&self) -> PathStyle {
        self.style
    }

    fn root(&self) -> String {
        match &self.selector {
            Some(sel) => format!("{}{}{}", self.namespace, self.style.sep(), sel),
            None => self.namespace.clone(),
        }
    }

    fn join(&self, segments: &[&str]) -> String {
        let sep = self.style.sep();
        let mut out = self.root();
        for seg in segments {
            out.push(sep);
            if self.style == PathStyle::Log {
                out.push_str(&sanitize_topic_segment(seg));
            } else {
                out.push_str(seg);
            }
        }
        out
    }

    /// `<ns>[<sep><sel>]<sep><plc><sep>tags<sep><tag-or-alias>`
    pub fn tag_path(&self, plc: &str, tag: &str) -> String {
        self.join(&[plc, "tags", tag])
    }

    /// `<ns>[<sep><sel>]<sep><plc><sep>health`; event-log topics instead get
    /// a `.health` suffix on the PLC topic.
    pub fn health_path(&self, plc: &str) -> String {
        if self.style == PathStyle::Log {
            let mut topic = self.join(&[plc]);
            topic.push_str(".health");
            topic
        } else {
            self.join(&[plc, "health"])
        }
    }

    pub fn write_path(&self, plc: &str) -> String {
        self.join(&[plc, "write"])
    }

    pub fn write_response_path(&self, plc: &str) -> String {
        self.join(&[plc, "write", "response"])
    }

    pub fn pack_path(&self, pack: &str) -> String {
        self.join(&["packs", pack])
    }
}

/// Event-log topic names only allow `[A-Za-z0-9._-]`; anything else becomes
/// `-`.
pub fn sanitize_topic_segment(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
