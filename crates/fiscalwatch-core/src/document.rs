use std::io;
use std::path::Path;

use roxmltree::{Document, Node};

/// Parsed tree of one XML file together with where it came from.
pub struct RawDocument<'a> {
    tree: Document<'a>,
    path: &'a Path,
}

impl<'a> RawDocument<'a> {
    pub fn parse(text: &'a str, path: &'a Path) -> Result<Self, roxmltree::Error> {
        Ok(Self {
            tree: Document::parse(text)?,
            path,
        })
    }

    pub fn root(&self) -> Node<'_, 'a> {
        self.tree.root_element()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn root_name(&self) -> &str {
        self.root().tag_name().name()
    }

    /// True when the root has a direct child element with this local name,
    /// whatever its namespace.
    pub fn root_has_child(&self, local_name: &str) -> bool {
        self.root()
            .children()
            .any(|c| c.is_element() && c.tag_name().name() == local_name)
    }
}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Turns raw file bytes into text. UTF-8 (with or without BOM) is taken as
/// is; otherwise the `encoding` of the XML declaration must name Latin-1.
pub fn decode_xml(bytes: Vec<u8>) -> io::Result<String> {
    let bytes = if bytes.starts_with(UTF8_BOM) {
        bytes[UTF8_BOM.len()..].to_vec()
    } else {
        bytes
    };

    let bytes = match String::from_utf8(bytes) {
        Ok(text) => return Ok(text),
        Err(e) => e.into_bytes(),
    };

    match declared_encoding(&bytes).map(|e| e.to_ascii_lowercase()) {
        Some(enc) if matches!(enc.as_str(), "iso-8859-1" | "latin1" | "latin-1" | "iso8859-1") => {
            Ok(bytes.iter().map(|&b| char::from(b)).collect())
        }
        Some(enc) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported XML encoding: {enc}"),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "document is not valid UTF-8 and declares no encoding",
        )),
    }
}

/// `encoding` pseudo-attribute of a leading `<?xml ...?>` declaration.
fn declared_encoding(bytes: &[u8]) -> Option<String> {
    let head = bytes.strip_prefix(b"<?xml")?;
    let end = head.windows(2).position(|w| w == b"?>")?;
    let decl: String = head[..end].iter().map(|&b| char::from(b)).collect();

    let rest = &decl[decl.find("encoding")? + "encoding".len()..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &rest[1..];
    Some(value[..value.find(quote)?].to_string())
}

/// First child element matching local name and namespace. `None` as the
/// namespace only matches unqualified elements.
pub fn child<'a, 'input>(
    node: Node<'a, 'input>,
    namespace: Option<&str>,
    local_name: &str,
) -> Option<Node<'a, 'input>> {
    node.children().find(|c| {
        c.is_element() && c.tag_name().name() == local_name && c.tag_name().namespace() == namespace
    })
}

/// Walks a chain of child elements.
pub fn descend<'a, 'input>(
    node: Node<'a, 'input>,
    namespace: Option<&str>,
    steps: &[&str],
) -> Option<Node<'a, 'input>> {
    steps
        .iter()
        .try_fold(node, |current, step| child(current, namespace, step))
}

/// Text of the element at `steps` below `node`.
pub fn text_at<'a>(node: Node<'a, '_>, namespace: Option<&str>, steps: &[&str]) -> Option<&'a str> {
    descend(node, namespace, steps).and_then(|n| n.text())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8_and_bom() {
        assert_eq!(decode_xml(b"<a>\xC3\xA7</a>".to_vec()).unwrap(), "<a>ç</a>");
        assert_eq!(decode_xml(b"\xEF\xBB\xBF<a/>".to_vec()).unwrap(), "<a/>");
    }

    #[test]
    fn test_decode_declared_latin1() {
        let bytes = b"<?xml version='1.0' encoding='ISO-8859-1'?><a>\xE7</a>".to_vec();
        assert_eq!(
            decode_xml(bytes).unwrap(),
            "<?xml version='1.0' encoding='ISO-8859-1'?><a>ç</a>"
        );
    }

    #[test]
    fn test_decode_rejects_unknown_bytes() {
        assert!(decode_xml(b"<a>\xE7</a>".to_vec()).is_err());
        assert!(decode_xml(b"<?xml version=\"1.0\" encoding=\"Shift_JIS\"?><a>\x82</a>".to_vec()).is_err());
    }

    const NS: &str = "urn:test";

    #[test]
    fn test_namespace_is_respected() {
        let xml = r#"<root xmlns="urn:test"><a><b>qualified</b></a></root>"#;
        let path = Path::new("/tmp/x.xml");
        let doc = RawDocument::parse(xml, path).unwrap();

        assert_eq!(text_at(doc.root(), Some(NS), &["a", "b"]), Some("qualified"));
        assert_eq!(text_at(doc.root(), None, &["a", "b"]), None);
    }

    #[test]
    fn test_unqualified_lookup() {
        let xml = "<root><a><b>plain</b></a></root>";
        let path = Path::new("/tmp/y.xml");
        let doc = RawDocument::parse(xml, path).unwrap();

        assert_eq!(text_at(doc.root(), None, &["a", "b"]), Some("plain"));
        assert_eq!(text_at(doc.root(), None, &["a", "missing"]), None);
        assert!(doc.root_has_child("a"));
        assert_eq!(doc.file_name(), "y.xml");
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        let path = Path::new("bad.xml");
        assert!(RawDocument::parse("<root><open></root>", path).is_err());
    }
}
