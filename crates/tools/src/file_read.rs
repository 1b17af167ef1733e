//! `read_file` adapter — extension-aware file reading with line windowing,
//! image and OOXML document handling, case-insensitive path fallback, and a
//! confirmation gate in front of credential-bearing locations.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use wf_domain::confirm::{Confirmer, OperationDetails};

use crate::sensitive::is_sensitive_path;
use crate::{gate, ToolError, ToolResult};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff"];

#[derive(Debug, Clone, Deserialize)]
pub struct FileReadRequest {
    pub path: String,
    /// Line to start from (0-indexed), text and document reads only.
    #[serde(default)]
    pub offset: Option<usize>,
    /// Maximum number of lines to return.
    #[serde(default)]
    pub limit: Option<usize>,
}

enum FileKind {
    Text,
    Image,
    Docx,
    Xlsx,
    Pptx,
    Pdf,
}

fn classify(path: &Path) -> FileKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        e if IMAGE_EXTENSIONS.contains(&e) => FileKind::Image,
        "docx" => FileKind::Docx,
        "xlsx" => FileKind::Xlsx,
        "pptx" => FileKind::Pptx,
        "pdf" => FileKind::Pdf,
        _ => FileKind::Text,
    }
}

/// Read a file, gating sensitive locations behind confirmation.
pub async fn read_file(
    req: FileReadRequest,
    line_cap: usize,
    confirmer: Option<&dyn Confirmer>,
) -> ToolResult {
    let path = resolve_path(&req.path)
        .ok_or_else(|| ToolError::Failure(format!("file not found: {}", req.path)))?;

    if is_sensitive_path(&path) {
        gate(
            confirmer,
            "read_sensitive_file",
            &path.display().to_string(),
            OperationDetails {
                tool_name: "read_file".into(),
                tool_args: json!({ "path": req.path }),
                affected_files: Some(vec![path.display().to_string()]),
                ..Default::default()
            },
        )
        .await?;
    }

    match classify(&path) {
        FileKind::Image => read_image(&path).await,
        FileKind::Pdf => Err(ToolError::Failure(format!(
            "cannot extract text from '{}': PDF extraction is not supported; \
             convert the document or read a text export instead",
            path.display()
        ))),
        FileKind::Docx => read_document(&path, "docx", req.offset, req.limit, line_cap).await,
        FileKind::Xlsx => read_document(&path, "xlsx", req.offset, req.limit, line_cap).await,
        FileKind::Pptx => read_document(&path, "pptx", req.offset, req.limit, line_cap).await,
        FileKind::Text => read_text(&path, req.offset, req.limit, line_cap).await,
    }
}

/// Exact path if it exists; otherwise try a case-insensitive match against
/// the parent directory's entries.
fn resolve_path(requested: &str) -> Option<PathBuf> {
    let path = PathBuf::from(requested);
    if path.exists() {
        return Some(path);
    }

    let parent = path.parent().filter(|p| p.exists())?;
    let wanted = path.file_name()?.to_str()?.to_lowercase();
    let entries = std::fs::read_dir(parent).ok()?;
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if name.to_lowercase() == wanted {
                return Some(parent.join(name));
            }
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Text windowing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Window {
    content: String,
    total_lines: usize,
    offset: usize,
    lines_returned: usize,
    truncated: bool,
}

/// Cut a line window out of text content. Without an explicit limit the
/// default cap applies and a truncation notice is appended.
fn window_lines(content: &str, offset: Option<usize>, limit: Option<usize>, cap: usize) -> Window {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let offset = offset.unwrap_or(0).min(total);
    let limit = limit.unwrap_or(cap);

    let selected: Vec<&str> = lines[offset..].iter().take(limit).copied().collect();
    let shown = selected.len();
    let truncated = offset + shown < total;

    let mut out = selected.join("\n");
    if truncated {
        out.push_str(&format!(
            "\n[truncated: showing lines {}-{} of {}; pass offset/limit to read more]",
            offset + 1,
            offset + shown,
            total
        ));
    }

    Window {
        content: out,
        total_lines: total,
        offset,
        lines_returned: shown,
        truncated,
    }
}

async fn read_text(
    path: &Path,
    offset: Option<usize>,
    limit: Option<usize>,
    cap: usize,
) -> ToolResult {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ToolError::Failure(format!("failed to read '{}': {e}", path.display())))?;
    let w = window_lines(&raw, offset, limit, cap);
    Ok(json!({
        "path": path.display().to_string(),
        "kind": "text",
        "content": w.content,
        "total_lines": w.total_lines,
        "offset": w.offset,
        "lines_returned": w.lines_returned,
        "truncated": w.truncated,
    }))
}

async fn read_image(path: &Path) -> ToolResult {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ToolError::Failure(format!("failed to read '{}': {e}", path.display())))?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok(json!({
        "path": path.display().to_string(),
        "kind": "image",
        "mime": mime.essence_str(),
        "base64": base64::engine::general_purpose::STANDARD.encode(&bytes),
        "bytes": bytes.len(),
    }))
}

async fn read_document(
    path: &Path,
    format: &str,
    offset: Option<usize>,
    limit: Option<usize>,
    cap: usize,
) -> ToolResult {
    let path_buf = path.to_path_buf();
    let format_owned = format.to_owned();
    // zip + quick-xml are synchronous; keep them off the runtime threads.
    let extracted = tokio::task::spawn_blocking(move || extract_ooxml(&path_buf, &format_owned))
        .await
        .map_err(|e| ToolError::Failure(format!("document extraction task failed: {e}")))?
        .map_err(ToolError::Failure)?;

    let w = window_lines(&extracted, offset, limit, cap);
    Ok(json!({
        "path": path.display().to_string(),
        "kind": "document",
        "format": format,
        "content": w.content,
        "total_lines": w.total_lines,
        "offset": w.offset,
        "lines_returned": w.lines_returned,
        "truncated": w.truncated,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OOXML extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn extract_ooxml(path: &Path, format: &str) -> Result<String, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("failed to open '{}': {e}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| format!("'{}' is not a valid OOXML archive: {e}", path.display()))?;

    let parts: Vec<String> = match format {
        "docx" => vec!["word/document.xml".to_owned()],
        "xlsx" => vec!["xl/sharedStrings.xml".to_owned()],
        "pptx" => {
            let mut slides: Vec<String> = archive
                .file_names()
                .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
                .map(|n| n.to_owned())
                .collect();
            slides.sort();
            slides
        }
        other => return Err(format!("unsupported document format '{other}'")),
    };

    let mut out = String::new();
    for name in parts {
        let mut entry = match archive.by_name(&name) {
            Ok(entry) => entry,
            // An xlsx without string cells has no sharedStrings part.
            Err(zip::result::ZipError::FileNotFound) => continue,
            Err(e) => return Err(format!("failed to read archive part '{name}': {e}")),
        };
        let mut xml = String::new();
        std::io::Read::read_to_string(&mut entry, &mut xml)
            .map_err(|e| format!("failed to read archive part '{name}': {e}"))?;
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&xml_text(&xml, format));
    }
    Ok(out)
}

/// Pull character data out of an OOXML part. Paragraph ends (`w:p` in docx,
/// `a:p` in pptx) and shared-string entries (`t` in xlsx) become newlines.
fn xml_text(xml: &str, format: &str) -> String {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut out = String::new();
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Text(text)) => {
                if let Ok(value) = text.unescape() {
                    out.push_str(&value);
                }
            }
            Ok(quick_xml::events::Event::End(end)) => {
                let name = end.name();
                let is_break = match format {
                    "docx" => name.as_ref() == b"w:p",
                    "pptx" => name.as_ref() == b"a:p",
                    "xlsx" => name.as_ref() == b"t",
                    _ => false,
                };
                if is_break && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    out.trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedConfirmer;

    #[test]
    fn window_within_cap() {
        let w = window_lines("a\nb\nc", None, None, 50);
        assert_eq!(w.content, "a\nb\nc");
        assert_eq!(w.total_lines, 3);
        assert!(!w.truncated);
    }

    #[test]
    fn window_applies_default_cap() {
        let content: String = (0..100).map(|i| format!("line{i}\n")).collect();
        let w = window_lines(&content, None, None, 50);
        assert_eq!(w.lines_returned, 50);
        assert!(w.truncated);
        assert!(w.content.contains("[truncated: showing lines 1-50 of 100"));
    }

    #[test]
    fn window_offset_and_limit() {
        let content = "l0\nl1\nl2\nl3\nl4";
        let w = window_lines(content, Some(1), Some(2), 50);
        assert!(w.content.starts_with("l1\nl2"));
        assert_eq!(w.offset, 1);
        assert_eq!(w.lines_returned, 2);
        assert!(w.truncated);
    }

    #[test]
    fn window_offset_past_end() {
        let w = window_lines("a\nb", Some(10), None, 50);
        assert_eq!(w.lines_returned, 0);
        assert!(!w.truncated);
    }

    #[tokio::test]
    async fn reads_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello\nworld\n").unwrap();

        let out = read_file(
            FileReadRequest {
                path: path.display().to_string(),
                offset: None,
                limit: None,
            },
            50,
            None,
        )
        .await
        .unwrap();
        assert_eq!(out["kind"], "text");
        assert_eq!(out["content"], "hello\nworld");
        assert_eq!(out["total_lines"], 2);
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let err = read_file(
            FileReadRequest {
                path: "/definitely/not/here.txt".into(),
                offset: None,
                limit: None,
            },
            50,
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn case_insensitive_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# title\n").unwrap();

        let requested = dir.path().join("readme.md");
        let out = read_file(
            FileReadRequest {
                path: requested.display().to_string(),
                offset: None,
                limit: None,
            },
            50,
            None,
        )
        .await
        .unwrap();
        assert_eq!(out["content"], "# title");
    }

    #[tokio::test]
    async fn image_returns_base64_and_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixel.png");
        std::fs::write(&path, [0x89, 0x50, 0x4E, 0x47]).unwrap();

        let out = read_file(
            FileReadRequest {
                path: path.display().to_string(),
                offset: None,
                limit: None,
            },
            50,
            None,
        )
        .await
        .unwrap();
        assert_eq!(out["kind"], "image");
        assert_eq!(out["mime"], "image/png");
        assert_eq!(out["base64"], "iVBORw==");
    }

    #[tokio::test]
    async fn pdf_is_a_textual_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, "%PDF-1.4").unwrap();

        let err = read_file(
            FileReadRequest {
                path: path.display().to_string(),
                offset: None,
                limit: None,
            },
            50,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Failure(_)));
        assert!(err.to_string().contains("PDF"));
    }

    #[tokio::test]
    async fn sensitive_path_without_context_denied() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = dir.path().join(".ssh");
        std::fs::create_dir(&ssh).unwrap();
        let key = ssh.join("id_rsa");
        std::fs::write(&key, "PRIVATE KEY").unwrap();

        let err = read_file(
            FileReadRequest {
                path: key.display().to_string(),
                offset: None,
                limit: None,
            },
            50,
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("confirmation"));
    }

    #[tokio::test]
    async fn sensitive_path_with_approval_reads() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = dir.path().join(".ssh");
        std::fs::create_dir(&ssh).unwrap();
        let key = ssh.join("known_hosts");
        std::fs::write(&key, "host entries").unwrap();

        let confirmer = ScriptedConfirmer::approving();
        let out = read_file(
            FileReadRequest {
                path: key.display().to_string(),
                offset: None,
                limit: None,
            },
            50,
            Some(&confirmer),
        )
        .await
        .unwrap();
        assert_eq!(out["content"], "host entries");
        let requests = confirmer.requests.lock();
        assert_eq!(requests[0].0, "read_sensitive_file");
    }

    #[test]
    fn docx_xml_text_extraction() {
        let xml = r#"<w:document xmlns:w="x"><w:body>
            <w:p><w:r><w:t>First paragraph</w:t></w:r></w:p>
            <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let text = xml_text(xml, "docx");
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        assert!(lines.contains(&"First paragraph"));
        assert!(lines.iter().any(|l| l.contains("Second paragraph")));
    }

    #[test]
    fn xlsx_shared_strings_extraction() {
        let xml = r#"<sst xmlns="x"><si><t>Alpha</t></si><si><t>Beta</t></si></sst>"#;
        let text = xml_text(xml, "xlsx");
        assert_eq!(text.lines().collect::<Vec<_>>(), vec!["Alpha", "Beta"]);
    }
}
