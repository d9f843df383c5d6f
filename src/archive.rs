use image::{ColorType, ImageFormat};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::io::{Cursor, Write};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Image could not be decoded: {0}")]
    Image(#[from] image::ImageError),

    #[error("Archive has no pages")]
    Empty,
}

/// Collects named blobs into a single downloadable archive.
pub trait ArchiveBuilder {
    fn add(&mut self, filename: &str, data: &[u8]) -> Result<(), ArchiveError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(self) -> Result<Vec<u8>, ArchiveError>
    where
        Self: Sized;
}

/// In-memory ZIP archive
pub struct ZipArchiveBuilder {
    zip: ZipWriter<Cursor<Vec<u8>>>,
    names: Vec<String>,
}

impl ZipArchiveBuilder {
    pub fn new() -> Self {
        Self {
            zip: ZipWriter::new(Cursor::new(Vec::new())),
            names: Vec::new(),
        }
    }

    /// Media is already compressed, so most entries are stored as-is.
    fn options_for(filename: &str) -> FileOptions {
        let lower = filename.to_ascii_lowercase();
        let compressed_media = [".jpg", ".jpeg", ".png", ".gif", ".webp", ".avif", ".mp4", ".webm"]
            .iter()
            .any(|ext| lower.ends_with(ext));
        let method = if compressed_media {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        FileOptions::default()
            .compression_method(method)
            .large_file(false)
    }
}

impl Default for ZipArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder for ZipArchiveBuilder {
    fn add(&mut self, filename: &str, data: &[u8]) -> Result<(), ArchiveError> {
        if self.names.iter().any(|n| n == filename) {
            return Err(ArchiveError::DuplicateEntry(filename.to_string()));
        }
        self.zip.start_file(filename, Self::options_for(filename))?;
        self.zip.write_all(data)?;
        self.names.push(filename.to_string());
        Ok(())
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn finish(mut self) -> Result<Vec<u8>, ArchiveError> {
        let cursor = self.zip.finish()?;
        Ok(cursor.into_inner())
    }
}

/// In-memory PDF with one page per image, each page exactly the image's size
/// (one pixel per point), so wide images give landscape pages. The entry name
/// only orders the pages; it does not end up in the document.
pub struct PdfArchiveBuilder {
    doc: Document,
    pages_id: ObjectId,
    pages: Vec<ObjectId>,
}

impl PdfArchiveBuilder {
    pub fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            pages: Vec::new(),
        }
    }

    /// JPEGs go in untouched; everything else is decoded to raw RGB, which
    /// `finish` deflates.
    fn image_stream(data: &[u8]) -> Result<(Stream, u32, u32), ArchiveError> {
        let decoded = image::load_from_memory(data)?;
        let (width, height) = (decoded.width(), decoded.height());

        let is_jpeg = matches!(image::guess_format(data), Ok(ImageFormat::Jpeg));
        let passthrough = match decoded.color() {
            ColorType::L8 if is_jpeg => Some("DeviceGray"),
            ColorType::Rgb8 if is_jpeg => Some("DeviceRGB"),
            _ => None,
        };

        let mut info = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "BitsPerComponent" => 8,
        };
        let stream = match passthrough {
            Some(color_space) => {
                info.set("ColorSpace", Object::Name(color_space.as_bytes().to_vec()));
                info.set("Filter", Object::Name(b"DCTDecode".to_vec()));
                Stream::new(info, data.to_vec()).with_compression(false)
            }
            None => {
                info.set("ColorSpace", Object::Name(b"DeviceRGB".to_vec()));
                Stream::new(info, decoded.to_rgb8().into_raw())
            }
        };
        Ok((stream, width, height))
    }
}

impl Default for PdfArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder for PdfArchiveBuilder {
    fn add(&mut self, filename: &str, data: &[u8]) -> Result<(), ArchiveError> {
        let (stream, width, height) = Self::image_stream(data)?;
        let image_id = self.doc.add_object(stream);

        let (w, h) = (width as i64, height as i64);
        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new("cm", vec![w.into(), 0.into(), 0.into(), h.into(), 0.into(), 0.into()]),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_id = self.doc.add_object(Stream::new(dictionary! {}, content.encode()?));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![0.into(), 0.into(), w.into(), h.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        self.pages.push(page_id);
        log::debug!("Added {} ({}x{}) as PDF page {}", filename, width, height, self.pages.len());
        Ok(())
    }

    fn len(&self) -> usize {
        self.pages.len()
    }

    fn finish(mut self) -> Result<Vec<u8>, ArchiveError> {
        if self.pages.is_empty() {
            return Err(ArchiveError::Empty);
        }
        let kids: Vec<Object> = self.pages.iter().map(|id| Object::Reference(*id)).collect();
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => self.pages.len() as i64,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        self.doc.compress();

        let mut out = Vec::new();
        self.doc.save_to(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img).write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn media_box(doc: &Document, page_id: ObjectId) -> Vec<i64> {
        let page = doc.get_dictionary(page_id).unwrap();
        let media_box = page.get(b"MediaBox").unwrap().as_array().unwrap();
        media_box.iter().map(|v| v.as_i64().unwrap()).collect()
    }

    /// Width, height and filter of the image drawn on `page_id`.
    fn page_image(doc: &Document, page_id: ObjectId) -> (i64, i64, Option<Vec<u8>>) {
        let page = doc.get_dictionary(page_id).unwrap();
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
        let image_id = xobjects.get(b"Im0").unwrap().as_reference().unwrap();
        let stream = doc.get_object(image_id).unwrap().as_stream().unwrap();
        let width = stream.dict.get(b"Width").unwrap().as_i64().unwrap();
        let height = stream.dict.get(b"Height").unwrap().as_i64().unwrap();
        let filter = stream.dict.get(b"Filter").ok().and_then(|f| f.as_name().ok()).map(<[u8]>::to_vec);
        (width, height, filter)
    }

    #[test]
    fn test_pdf_has_one_page_per_image() {
        let mut builder = PdfArchiveBuilder::new();
        builder.add("image_1.jpeg", &encoded(30, 60, ImageFormat::Jpeg)).unwrap();
        builder.add("image_2.png", &encoded(80, 20, ImageFormat::Png)).unwrap();
        assert_eq!(builder.len(), 2);

        let bytes = builder.finish().unwrap();
        assert!(bytes.starts_with(b"%PDF-1.5"));

        let doc = Document::load_mem(&bytes).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);

        // Portrait JPEG, embedded as-is.
        assert_eq!(media_box(&doc, pages[&1]), vec![0, 0, 30, 60]);
        let (w, h, filter) = page_image(&doc, pages[&1]);
        assert_eq!((w, h), (30, 60));
        assert_eq!(filter.as_deref(), Some(&b"DCTDecode"[..]));

        // Landscape PNG, re-encoded.
        assert_eq!(media_box(&doc, pages[&2]), vec![0, 0, 80, 20]);
        let (w, h, filter) = page_image(&doc, pages[&2]);
        assert_eq!((w, h), (80, 20));
        assert_eq!(filter.as_deref(), Some(&b"FlateDecode"[..]));
    }

    #[test]
    fn test_pdf_rejects_non_images() {
        let mut builder = PdfArchiveBuilder::new();
        assert!(matches!(builder.add("image_1.jpeg", b"jpeg:nope"), Err(ArchiveError::Image(_))));
        assert!(builder.is_empty());
        assert!(matches!(builder.finish(), Err(ArchiveError::Empty)));
    }

    #[test]
    fn test_zip_contains_entries() {
        let mut builder = ZipArchiveBuilder::new();
        builder.add("images/image_1.jpeg", &[0xFF, 0xD8, 0xFF]).unwrap();
        builder.add("notes.txt", b"hello hello hello").unwrap();
        assert_eq!(builder.len(), 2);

        let bytes = builder.finish().unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);

        let mut image = archive.by_name("images/image_1.jpeg").unwrap();
        assert_eq!(image.compression(), CompressionMethod::Stored);
        let mut data = Vec::new();
        image.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let mut builder = ZipArchiveBuilder::new();
        builder.add("a.jpg", b"1").unwrap();
        assert!(matches!(builder.add("a.jpg", b"2"), Err(ArchiveError::DuplicateEntry(_))));
    }

    #[test]
    fn test_empty_archive() {
        let builder = ZipArchiveBuilder::new();
        assert!(builder.is_empty());
        assert!(!builder.finish().unwrap().is_empty());
    }
}
