//! Response model and rendering (spec §3 `Response`, §4.3).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One host's reply to one command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub host: String,
    pub response: String,
    /// Empty means success.
    pub error: String,
    pub header: Vec<String>,
    pub tabular: Vec<Vec<String>>,
    pub data: Option<serde_json::Value>,
    pub annotate: Option<bool>,
    pub sort: Option<bool>,
    pub compress: Option<bool>,
    pub csv: Option<bool>,
    pub headers: Option<bool>,
    pub json: Option<bool>,
}

impl Response {
    pub fn ok(host: impl Into<String>, text: impl Into<String>) -> Self {
        Self { host: host.into(), response: text.into(), ..Default::default() }
    }

    pub fn error(host: impl Into<String>, error: impl Into<String>) -> Self {
        Self { host: host.into(), error: error.into(), ..Default::default() }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// A slice of responses from one dispatch step.
pub type ResponseSet = Vec<Response>;

/// Process-wide rendering style; overridable per-set by the first
/// response's style flags (spec §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderStyle {
    pub annotate: bool,
    pub sort: bool,
    pub compress: bool,
    pub csv: bool,
    pub headers: bool,
    pub json: bool,
}

impl RenderStyle {
    /// Apply the overrides carried on the first response of a set.
    fn overridden_by(&self, first: &Response) -> Self {
        Self {
            annotate: first.annotate.unwrap_or(self.annotate),
            sort: first.sort.unwrap_or(self.sort),
            compress: first.compress.unwrap_or(self.compress),
            csv: first.csv.unwrap_or(self.csv),
            headers: first.headers.unwrap_or(self.headers),
            json: first.json.unwrap_or(self.json),
        }
    }
}

/// Render one ResponseSet to text under `defaults`, cascading overrides
/// from the first response. Fails outright (no partial render) if the set
/// mixes tabular responses with different header columns.
pub fn render(responses: &ResponseSet, defaults: &RenderStyle) -> Result<String> {
    if responses.is_empty() {
        return Ok(String::new());
    }

    let style = defaults.overridden_by(&responses[0]);
    let header = validate_headers(responses)?;

    if style.json {
        return Ok(render_json(responses)?);
    }

    if let Some(header) = header {
        return render_tabular(responses, &header, &style);
    }

    render_plain(responses, &style)
}

fn validate_headers(responses: &[Response]) -> Result<Option<Vec<String>>> {
    let mut found: Option<&Vec<String>> = None;
    for r in responses {
        if r.header.is_empty() {
            continue;
        }
        match found {
            None => found = Some(&r.header),
            Some(h) if h == &r.header => {}
            Some(_) => return Err(Error::Render("mismatched header columns in response set".to_string())),
        }
    }
    Ok(found.cloned())
}

fn render_json(responses: &[Response]) -> Result<String> {
    Ok(serde_json::to_string(responses)?)
}

fn render_tabular(responses: &[Response], header: &[String], style: &RenderStyle) -> Result<String> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    for r in responses {
        for row in &r.tabular {
            rows.push(row.clone());
        }
    }

    if style.sort {
        rows.sort_by(|a, b| compare_rows(a, b));
    }

    if style.csv {
        let mut out = String::new();
        if style.headers {
            out.push_str(&header.join(","));
            out.push('\n');
        }
        for row in &rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        return Ok(out);
    }

    let mut out = String::new();
    if style.headers {
        out.push_str(&header.join("\t"));
        out.push('\n');
    }
    for row in &rows {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    Ok(out)
}

fn compare_rows(a: &[String], b: &[String]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x.parse::<i64>(), y.parse::<i64>()) {
            (Ok(xi), Ok(yi)) => xi.cmp(&yi),
            _ => x.cmp(y),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn render_plain(responses: &[Response], style: &RenderStyle) -> Result<String> {
    let mut lines: Vec<(String, String)> = Vec::new();
    for r in responses {
        let text = if r.is_ok() { r.response.clone() } else { r.error.clone() };
        lines.push((r.host.clone(), text));
    }

    if style.compress {
        return Ok(render_compressed(&lines, style.annotate));
    }

    let mut out = String::new();
    for (host, text) in &lines {
        if style.annotate {
            out.push_str(&format!("{host}: {text}\n"));
        } else {
            out.push_str(text);
            out.push('\n');
        }
    }
    Ok(out)
}

/// Group hosts with identical response text, rendering the host list as a
/// compressed range (spec §4.3: `foo[1-3,5]`).
fn render_compressed(lines: &[(String, String)], annotate: bool) -> String {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for (host, text) in lines {
        if let Some(group) = groups.iter_mut().find(|(t, _)| t == text) {
            group.1.push(host.clone());
        } else {
            groups.push((text.clone(), vec![host.clone()]));
        }
    }

    let mut out = String::new();
    for (text, hosts) in groups {
        if annotate {
            out.push_str(&format!("{}: {}\n", compress_hosts(&hosts), text));
        } else {
            out.push_str(&text);
            out.push('\n');
        }
    }
    out
}

/// Compress a host list like `["foo1", "foo2", "foo3", "foo5"]` into
/// `"foo[1-3,5]"`.
fn compress_hosts(hosts: &[String]) -> String {
    let mut by_prefix: Vec<(String, Vec<u64>)> = Vec::new();
    let mut bare: Vec<String> = Vec::new();

    for host in hosts {
        match split_trailing_digits(host) {
            Some((prefix, num)) => {
                if let Some(group) = by_prefix.iter_mut().find(|(p, _)| p == &prefix) {
                    group.1.push(num);
                } else {
                    by_prefix.push((prefix, vec![num]));
                }
            }
            None => bare.push(host.clone()),
        }
    }

    let mut parts: Vec<String> = Vec::new();
    for (prefix, mut nums) in by_prefix {
        nums.sort_unstable();
        nums.dedup();
        if nums.len() == 1 {
            parts.push(format!("{prefix}{}", nums[0]));
        } else {
            parts.push(format!("{prefix}[{}]", compress_ranges(&nums)));
        }
    }
    parts.extend(bare);
    parts.join(",")
}

fn split_trailing_digits(host: &str) -> Option<(String, u64)> {
    let digit_start = host.char_indices().rev().take_while(|(_, c)| c.is_ascii_digit()).last().map(|(i, _)| i)?;
    if digit_start == host.len() {
        return None;
    }
    let (prefix, digits) = host.split_at(digit_start);
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u64>().ok().map(|n| (prefix.to_string(), n))
}

fn compress_ranges(sorted_unique: &[u64]) -> String {
    let mut ranges: Vec<String> = Vec::new();
    let mut i = 0;
    while i < sorted_unique.len() {
        let start = sorted_unique[i];
        let mut end = start;
        while i + 1 < sorted_unique.len() && sorted_unique[i + 1] == end + 1 {
            end = sorted_unique[i + 1];
            i += 1;
        }
        if start == end {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{start}-{end}"));
        }
        i += 1;
    }
    ranges.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_render_without_annotate() {
        let set = vec![Response::ok("h1", "hello")];
        let out = render(&set, &RenderStyle::default()).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn annotate_prefixes_host() {
        let set = vec![Response::ok("h1", "hello")];
        let style = RenderStyle { annotate: true, ..Default::default() };
        let out = render(&set, &style).unwrap();
        assert_eq!(out, "h1: hello\n");
    }

    #[test]
    fn compress_groups_identical_responses() {
        let set = vec![
            Response::ok("foo1", "up"),
            Response::ok("foo2", "up"),
            Response::ok("foo3", "up"),
            Response::ok("foo5", "up"),
            Response::ok("bar1", "down"),
        ];
        let style = RenderStyle { annotate: true, compress: true, ..Default::default() };
        let out = render(&set, &style).unwrap();
        assert!(out.contains("foo[1-3,5]: up"));
        assert!(out.contains("bar1: down"));
    }

    #[test]
    fn mismatched_headers_fail_render() {
        let set = vec![
            Response { host: "h1".into(), header: vec!["a".into()], ..Default::default() },
            Response { host: "h2".into(), header: vec!["b".into()], ..Default::default() },
        ];
        let err = render(&set, &RenderStyle::default()).unwrap_err();
        assert!(matches!(err, Error::Render(_)));
    }

    #[test]
    fn tabular_sort_is_numeric_when_both_parse() {
        let set = vec![Response {
            host: "h1".into(),
            header: vec!["id".into()],
            tabular: vec![vec!["10".into()], vec!["2".into()], vec!["1".into()]],
            ..Default::default()
        }];
        let style = RenderStyle { sort: true, ..Default::default() };
        let out = render(&set, &style).unwrap();
        assert_eq!(out, "1\n2\n10\n");
    }

    #[test]
    fn tabular_sort_falls_back_to_lexicographic() {
        let set = vec![Response {
            host: "h1".into(),
            header: vec!["name".into()],
            tabular: vec![vec!["banana".into()], vec!["apple".into()]],
            ..Default::default()
        }];
        let style = RenderStyle { sort: true, ..Default::default() };
        let out = render(&set, &style).unwrap();
        assert_eq!(out, "apple\nbanana\n");
    }

    #[test]
    fn csv_rendering_includes_header_when_requested() {
        let set = vec![Response {
            host: "h1".into(),
            header: vec!["a".into(), "b".into()],
            tabular: vec![vec!["1".into(), "2".into()]],
            ..Default::default()
        }];
        let style = RenderStyle { csv: true, headers: true, ..Default::default() };
        let out = render(&set, &style).unwrap();
        assert_eq!(out, "a,b\n1,2\n");
    }

    #[test]
    fn compress_hosts_handles_mixed_prefixes() {
        let hosts = vec!["node1".to_string(), "node2".to_string(), "gw".to_string()];
        assert_eq!(compress_hosts(&hosts), "node[1-2],gw");
    }
}
