//! HWPX (OWPML) reader. An HWPX file is a zip package whose body lives in
//! `Contents/section{N}.xml`; text runs are `<hp:t>` elements inside `<hp:p>` paragraphs.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use zip::ZipArchive;

const SECTION_PREFIX: &str = "Contents/section";
const SECTION_SUFFIX: &str = ".xml";

#[derive(Debug, Error)]
pub enum HwpxError {
    #[error("reading package: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("reading section {name}: {source}")]
    Section { name: String, source: std::io::Error },
    #[error("parsing section {name}: {message}")]
    Xml { name: String, message: String },
    #[error("package has no Contents/section*.xml")]
    NoSections,
}

fn section_index(name: &str) -> Option<u32> {
    name.strip_prefix(SECTION_PREFIX)?
        .strip_suffix(SECTION_SUFFIX)?
        .parse()
        .ok()
}

/// Paragraph text of every body section, in section order.
pub fn hwpx_to_text(bytes: &[u8]) -> Result<String, HwpxError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut sections = archive
        .file_names()
        .filter_map(|name| section_index(name).map(|idx| (idx, name.to_string())))
        .collect::<Vec<_>>();
    if sections.is_empty() {
        return Err(HwpxError::NoSections);
    }
    sections.sort();

    let mut paragraphs = Vec::new();
    for (_, name) in sections {
        let mut xml = String::new();
        archive
            .by_name(&name)?
            .read_to_string(&mut xml)
            .map_err(|source| HwpxError::Section {
                name: name.clone(),
                source,
            })?;
        section_paragraphs(&xml, &mut paragraphs).map_err(|message| HwpxError::Xml { name, message })?;
    }
    Ok(paragraphs.join("\n"))
}

fn section_paragraphs(xml: &str, out: &mut Vec<String>) -> Result<(), String> {
    let mut reader = Reader::from_str(xml);
    let mut current = String::new();
    let mut in_text = 0usize;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text += 1,
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = in_text.saturating_sub(1),
                b"p" => {
                    let line = current.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !line.is_empty() {
                        out.push(line);
                    }
                    current.clear();
                }
                _ => {}
            },
            // Tabs and line breaks inside a run.
            Event::Empty(e) if in_text > 0 && matches!(e.local_name().as_ref(), b"tab" | b"lineBreak") => {
                current.push(' ');
            }
            Event::Text(t) if in_text > 0 => current.push_str(&t.unescape().map_err(|e| e.to_string())?),
            Event::CData(t) if in_text > 0 => current.push_str(&String::from_utf8_lossy(&t)),
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(())
}
