//! The SMTP extensions offered by a server or discovered by a client,
//! keyed case-insensitively with an optional parameter string each.

#[derive(Debug, Clone, Default)]
pub struct Extensions {
    items: Vec<(String, Option<String>)>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all known extensions.
    pub fn reset(&mut self) {
        self.items.clear();
    }

    /// Case-insensitive membership test, e.g.
    /// `extensions.contains("PIPELINING")`.
    pub fn contains(&self, ext: &str) -> bool {
        self.position(ext).is_some()
    }

    /// The parameter associated with an extension, when both exist.
    pub fn getparam(&self, ext: &str) -> Option<&str> {
        self.position(ext)
            .and_then(|i| self.items[i].1.as_deref())
    }

    /// The parameter parsed to another type; `None` when the extension or
    /// parameter is missing or fails to parse.
    pub fn getparam_parsed<T: std::str::FromStr>(&self, ext: &str) -> Option<T> {
        self.getparam(ext).and_then(|p| p.parse().ok())
    }

    /// Add an extension with no parameter. The keyword is upper-cased; an
    /// existing entry is replaced.
    pub fn add(&mut self, ext: &str) {
        self.insert(ext, None);
    }

    /// Add an extension carrying a parameter string.
    pub fn add_with_param(&mut self, ext: &str, param: impl Into<String>) {
        self.insert(ext, Some(param.into()));
    }

    /// Remove the given extension, reporting whether it existed.
    pub fn remove(&mut self, ext: &str) -> bool {
        match self.position(ext) {
            Some(i) => {
                self.items.remove(i);
                true
            }
            None => false,
        }
    }

    /// Parse the EHLO response body: the first line is the free-form
    /// greeting and is returned; each subsequent line is ingested as
    /// `KEYWORD [PARAM]`.
    pub fn parse_string(&mut self, string: &str) -> String {
        let mut lines = string.split("\r\n").flat_map(|l| l.split('\n'));

        let header = lines.next().unwrap_or_default().to_owned();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (keyword, param) = match line.split_once(char::is_whitespace) {
                Some((keyword, param)) => (keyword, Some(param.trim())),
                None => (line, None),
            };
            if !is_keyword(keyword) {
                continue;
            }
            match param.filter(|p| !p.is_empty()) {
                Some(param) => self.add_with_param(keyword, param),
                None => self.add(keyword),
            }
        }

        header
    }

    /// Render the extensions under the given greeting line, separated by
    /// CRLF, as used in an EHLO response message.
    pub fn build_string(&self, header: &str) -> String {
        let mut out = String::from(header);
        for (keyword, param) in &self.items {
            out.push_str("\r\n");
            out.push_str(keyword);
            if let Some(param) = param {
                out.push(' ');
                out.push_str(param);
            }
        }
        out
    }

    fn position(&self, ext: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(ext))
    }

    fn insert(&mut self, ext: &str, param: Option<String>) {
        let keyword = ext.to_ascii_uppercase();
        match self.position(&keyword) {
            Some(i) => self.items[i].1 = param,
            None => self.items.push((keyword, param)),
        }
    }
}

fn is_keyword(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}
