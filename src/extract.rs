//! Plain-text extraction for uploaded documents.
//!
//! Takes raw bytes plus a MIME type and returns UTF-8 text ready for
//! chunking. Supported types: PDF, DOCX, XLSX, HTML, plain text, markdown.
//! Unsupported MIME types and unreadable files are fatal, non-retryable
//! errors; the upload handler rejects them before anything is enqueued.

use std::io::Read;

use crate::error::{Error, Result};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_HTML: &str = "text/html";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extract plain text from document bytes.
pub fn extract_text(bytes: &[u8], mime_type: &str) -> Result<String> {
    match mime_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        MIME_HTML => extract_html(bytes),
        MIME_TEXT | MIME_MARKDOWN => extract_plain(bytes),
        other => Err(Error::fatal(format!("unsupported file type: {}", other))),
    }
}

fn extract_plain(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::fatal("text upload is not valid UTF-8"))
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::fatal(format!("PDF extraction failed: {}", e)))
}

// ============ OOXML (docx, xlsx) ============

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::fatal(format!("OOXML container unreadable: {}", e)))
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| Error::fatal(format!("OOXML entry {} missing: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| Error::fatal(format!("OOXML entry {} unreadable: {}", name, e)))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(Error::fatal(format!(
            "OOXML entry {} exceeds {} byte limit",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Collect the text content of every `<{tag}>` element in an XML stream.
fn collect_xml_text(xml: &[u8], tag: &[u8], joiner: &str) -> Result<String> {
    let mut pieces: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut depth_in_tag = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == tag {
                    depth_in_tag += 1;
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if depth_in_tag > 0 => {
                let text = t.unescape().unwrap_or_default();
                if !text.is_empty() {
                    pieces.push(text.into_owned());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == tag {
                    depth_in_tag = depth_in_tag.saturating_sub(1);
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(Error::fatal(format!("OOXML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(pieces.join(joiner))
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry(&mut archive, "word/document.xml")?;
    // Word stores runs in <w:t> elements.
    collect_xml_text(&xml, b"t", " ")
}

fn extract_xlsx(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;

    // Shared strings are referenced by index from cells of type "s".
    let shared: Vec<String> = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        let xml = read_zip_entry(&mut archive, "xl/sharedStrings.xml")?;
        collect_shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let mut sheet_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    sheet_names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out: Vec<String> = Vec::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry(&mut archive, &name)?;
        let text = extract_sheet_cells(&xml, &shared)?;
        if !text.is_empty() {
            out.push(text);
        }
    }
    Ok(out.join("\n"))
}

fn collect_shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                    current.clear();
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_si => {
                current.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(Error::fatal(format!("OOXML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn extract_sheet_cells(xml: &[u8], shared: &[String]) -> Result<String> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(t)) if in_value => {
                let v = t.unescape().unwrap_or_default();
                let v = v.trim();
                if !v.is_empty() {
                    if cell_is_shared {
                        if let Ok(i) = v.parse::<usize>() {
                            if let Some(s) = shared.get(i) {
                                cells.push(s.clone());
                            }
                        }
                    } else {
                        cells.push(v.to_string());
                    }
                }
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => cell_is_shared = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(Error::fatal(format!("OOXML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

// ============ HTML ============

/// Strip markup from an HTML document, skipping script and style bodies.
/// Real-world HTML is rarely well-formed XML, so unmatched end tags are
/// tolerated.
fn extract_html(bytes: &[u8]) -> Result<String> {
    let mut out: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(bytes);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;

    let mut buf = Vec::new();
    let mut skip_depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = e.local_name();
                if matches!(name.as_ref(), b"script" | b"style") {
                    skip_depth += 1;
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                if matches!(name.as_ref(), b"script" | b"style") {
                    skip_depth = skip_depth.saturating_sub(1);
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if skip_depth == 0 => {
                let text = t.unescape().unwrap_or_default();
                let text = text.trim();
                if !text.is_empty() {
                    out.push(text.to_string());
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            // Tolerate malformed markup; emit what was collected so far.
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out.join("\n"))
}
