//! Outbound attachment rendering, shared by every adapter.
//!
//! Agent output embeds file references three ways, scanned in this order:
//! 1. `[image: PATH]` literal markers
//! 2. Markdown images `![caption](PATH_OR_URL)`
//! 3. Bare references: backtick-quoted paths, absolute paths, or paths
//!    rooted at a whitelisted subdirectory
//!
//! Each token resolves against the absolute path, then against the
//! workspace. Resolved files become typed attachments and leave the text;
//! unresolved remote URLs stay inline as links; unresolved local markers
//! are removed. The remaining text is whitespace-collapsed.

use std::path::{Path, PathBuf};

use regex::Regex;

/// Attachment type, chosen by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Document,
}

const IMAGE_EXTS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];
const AUDIO_EXTS: &[&str] = &["mp3", "wav", "ogg", "m4a", "flac", "aac"];
const VIDEO_EXTS: &[&str] = &["mp4", "mov", "webm", "avi", "mkv"];

/// Classify a path by extension. Everything unrecognized is a document.
pub fn classify(path: &Path) -> AttachmentKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if IMAGE_EXTS.contains(&ext.as_str()) {
        AttachmentKind::Image
    } else if AUDIO_EXTS.contains(&ext.as_str()) {
        AttachmentKind::Audio
    } else if VIDEO_EXTS.contains(&ext.as_str()) {
        AttachmentKind::Video
    } else {
        AttachmentKind::Document
    }
}

/// MIME type by extension (for bridges that need one on the wire).
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// A file extracted from outbound content.
#[derive(Clone, Debug)]
pub struct ResolvedAttachment {
    pub path: PathBuf,
    pub kind: AttachmentKind,
    pub filename: String,
}

/// The result of scanning outbound content.
#[derive(Clone, Debug, Default)]
pub struct RenderedOutbound {
    /// Text left over after extracting attachments, whitespace-collapsed.
    pub text: String,
    /// Attachments to send, in discovery order, deduplicated.
    pub attachments: Vec<ResolvedAttachment>,
}

/// Resolve a raw path against the absolute path, then the workspace.
fn resolve_file(raw: &str, workspace: Option<&Path>) -> Option<PathBuf> {
    let direct = PathBuf::from(raw);
    if direct.is_file() {
        return Some(direct);
    }
    if let Some(ws) = workspace {
        let joined = ws.join(raw);
        if joined.is_file() {
            return Some(joined);
        }
    }
    None
}

fn push_attachment(attachments: &mut Vec<ResolvedAttachment>, path: PathBuf) {
    if attachments.iter().any(|a| a.path == path) {
        return;
    }
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "attachment".to_string());
    let kind = classify(&path);
    attachments.push(ResolvedAttachment {
        path,
        kind,
        filename,
    });
}

/// Scan outbound content for file references.
pub fn render_outbound(content: &str, workspace: Option<&Path>) -> RenderedOutbound {
    let mut text = content.to_string();
    let mut attachments: Vec<ResolvedAttachment> = Vec::new();

    // 1) [image: PATH] markers. Unresolved ones are removed outright.
    let re_image_tag = Regex::new(r"\[image:\s*([^\]]+)\]").unwrap();
    for caps in re_image_tag.captures_iter(content) {
        if let Some(path) = resolve_file(caps[1].trim(), workspace) {
            push_attachment(&mut attachments, path);
        }
    }
    text = re_image_tag.replace_all(&text, "").to_string();

    // 2) Markdown images. Local paths attach; remote URLs stay inline as
    //    links; unresolved local paths reduce to their caption.
    let re_md_image = Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").unwrap();
    let snapshot = text.clone();
    for caps in re_md_image.captures_iter(&snapshot) {
        let whole = caps.get(0).unwrap().as_str();
        let caption = caps[1].trim().to_string();
        let raw_path = caps[2].trim().to_string();

        if let Some(path) = resolve_file(&raw_path, workspace) {
            push_attachment(&mut attachments, path);
            text = text.replace(whole, "");
        } else if raw_path.starts_with("http://") || raw_path.starts_with("https://") {
            let inline = if caption.is_empty() {
                raw_path.clone()
            } else {
                format!("{caption}: {raw_path}")
            };
            text = text.replace(whole, &inline);
        } else {
            text = text.replace(whole, &caption);
        }
    }

    // 3) Bare file references: backticked, absolute, or rooted at a
    //    whitelisted subdirectory. Only resolved matches leave the text.
    let re_file = Regex::new(
        r"(?:`([^`]+\.\w{1,5})`|(/[\w./ -]+\.\w{1,5})|((?:screenshots|media|files|documents|output|generated)/[\w./ -]+\.\w{1,5}))",
    )
    .unwrap();
    let snapshot = text.clone();
    for caps in re_file.captures_iter(&snapshot) {
        let whole = caps.get(0).unwrap().as_str();
        let raw = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .unwrap()
            .as_str()
            .trim();

        if let Some(path) = resolve_file(raw, workspace) {
            push_attachment(&mut attachments, path);
            text = text.replace(whole, "");
        }
    }

    // Collapse the holes left by extracted references.
    let re_blank = Regex::new(r"\n{3,}").unwrap();
    let text = re_blank.replace_all(&text, "\n\n").trim().to_string();

    RenderedOutbound { text, attachments }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
