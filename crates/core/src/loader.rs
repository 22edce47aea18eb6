use crate::error::LoadError;
use crate::models::{Document, DocumentFormat};
use lopdf::Document as PdfDocument;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Turns an uploaded document into raw text.
pub trait TextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, LoadError>;
}

#[derive(Debug, Default)]
pub struct LopdfExtractor;

impl TextExtractor for LopdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, LoadError> {
        let document =
            PdfDocument::load_mem(bytes).map_err(|error| LoadError::PdfParse(error.to_string()))?;

        let mut text = String::new();
        for page_no in document.get_pages().into_keys() {
            let page = document
                .extract_text(&[page_no])
                .map_err(|error| LoadError::PdfParse(error.to_string()))?;
            text.push_str(&page);
        }

        Ok(text.trim().to_string())
    }
}

#[derive(Debug, Default)]
pub struct Utf8Extractor;

impl TextExtractor for Utf8Extractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, LoadError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

pub fn load(document: &Document) -> Result<String, LoadError> {
    let text = match document.format {
        DocumentFormat::Pdf => LopdfExtractor.extract(&document.bytes)?,
        DocumentFormat::PlainText => Utf8Extractor.extract(&document.bytes)?,
    };

    debug!(
        source = %document.name,
        format = ?document.format,
        chars = text.len(),
        "loaded document"
    );
    Ok(text)
}

pub fn read_document(path: &Path) -> Result<Document, LoadError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| LoadError::MissingFileName(path.display().to_string()))?;

    // reject before reading so an unsupported upload never touches the disk
    DocumentFormat::from_file_name(name)?;
    let bytes = fs::read(path)?;
    Document::new(name, bytes)
}

pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| DocumentFormat::from_file_name(name).is_ok());

        if supported {
            files.push(entry.path().to_path_buf());
        } else {
            debug!(path = %entry.path().display(), "skipping unsupported file");
        }
    }

    files.sort_unstable();
    files
}

pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

pub struct FolderLoad {
    pub documents: Vec<Document>,
    pub skipped: Vec<SkippedDocument>,
}

pub fn load_folder(folder: &Path) -> Result<FolderLoad, LoadError> {
    let files = discover_documents(folder);

    if files.is_empty() {
        return Err(LoadError::InvalidArgument(format!(
            "no pdf or txt files found in {}",
            folder.display()
        )));
    }

    let mut documents = Vec::new();
    let mut skipped = Vec::new();

    for path in files {
        info!(path = %path.display(), "loading file");
        match read_document(&path) {
            Ok(document) => documents.push(document),
            Err(error) => skipped.push(SkippedDocument {
                path,
                reason: error.to_string(),
            }),
        }
    }

    Ok(FolderLoad { documents, skipped })
}
