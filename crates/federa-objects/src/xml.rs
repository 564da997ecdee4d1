//! Minimal S3 XML helpers
//!
//! S3 responses are flat enough that locating elements by tag is all the
//! backend needs.

/// Extract the text of the first `<element>` in `xml`
pub fn extract_xml_value(xml: &str, element: &str) -> Option<String> {
    let start_tag = format!("<{}>", element);
    let end_tag = format!("</{}>", element);

    let start = xml.find(&start_tag)? + start_tag.len();
    let end = xml[start..].find(&end_tag)? + start;
    Some(unescape_xml(&xml[start..end]))
}

/// Every `<element>...</element>` block in `xml`, tags included
pub fn extract_xml_blocks<'a>(xml: &'a str, element: &str) -> Vec<&'a str> {
    let start_tag = format!("<{}>", element);
    let end_tag = format!("</{}>", element);

    let mut blocks = Vec::new();
    let mut pos = 0;
    while let Some(start) = xml[pos..].find(&start_tag) {
        let start = pos + start;
        match xml[start..].find(&end_tag) {
            Some(end) => {
                let stop = start + end + end_tag.len();
                blocks.push(&xml[start..stop]);
                pos = stop;
            }
            None => break,
        }
    }
    blocks
}

pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_value_and_blocks() {
        let xml = "<R><Part><N>1</N></Part><Part><N>2</N></Part><K>a&amp;b</K></R>";
        let blocks = extract_xml_blocks(xml, "Part");
        assert_eq!(blocks.len(), 2);
        assert_eq!(extract_xml_value(blocks[1], "N").as_deref(), Some("2"));
        assert_eq!(extract_xml_value(xml, "K").as_deref(), Some("a&b"));
        assert_eq!(extract_xml_value(xml, "Missing"), None);
    }

    #[test]
    fn test_escape_roundtrip() {
        let raw = "a<b>&\"c'";
        assert_eq!(unescape_xml(&escape_xml(raw)), raw);
    }
}
