//! PDF page splitting.
//!
//! [`PageSplitter`] turns a PDF into one encoded image per page, in page order.
//! [`LopdfSplitter`] handles scanned documents by pulling the embedded page
//! raster out of each page's resources; vector-only pages are not rasterized.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GrayImage, ImageOutputFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::io::Cursor;
use tracing::{debug, trace};

/// Resource inheritance deeper than this is treated as a broken page tree.
const MAX_TREE_DEPTH: usize = 32;

pub trait PageSplitter: Send + Sync {
    /// Split a PDF into ordered page images. Any failure fails the whole document.
    fn split_pages(&self, pdf: &[u8]) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfSplitter;

impl PageSplitter for LopdfSplitter {
    fn split_pages(&self, pdf: &[u8]) -> Result<Vec<Vec<u8>>> {
        let doc = Document::load_mem(pdf).map_err(|e| anyhow!("Failed to load PDF: {}", e))?;

        let pages = doc.get_pages();
        if pages.is_empty() {
            anyhow::bail!("PDF has no pages");
        }

        let images = pages
            .into_iter()
            .map(|(page_num, page_id)| {
                page_image(&doc, page_id).with_context(|| format!("page {}", page_num))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Split PDF ({} bytes) into {} page images", pdf.len(), images.len());
        Ok(images)
    }
}

fn page_image(doc: &Document, page_id: ObjectId) -> Result<Vec<u8>> {
    let resources = page_resources(doc, page_id)?.context("page has no resources")?;
    let stream = largest_image(doc, resources)?.context("page has no embedded raster image")?;
    encode_image(stream)
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object> {
    match obj {
        Object::Reference(id) => doc
            .get_object(*id)
            .map_err(|e| anyhow!("Broken reference {:?}: {}", id, e)),
        other => Ok(other),
    }
}

fn as_dict(obj: &Object) -> Result<&Dictionary> {
    obj.as_dict().map_err(|e| anyhow!("Expected dictionary: {}", e))
}

/// The page's `/Resources`, inherited from ancestor page-tree nodes when absent.
fn page_resources(doc: &Document, page_id: ObjectId) -> Result<Option<&Dictionary>> {
    let mut node = doc
        .get_dictionary(page_id)
        .map_err(|e| anyhow!("Missing page object: {}", e))?;

    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(resources) = node.get(b"Resources") {
            return Ok(Some(as_dict(resolve(doc, resources)?)?));
        }
        match node.get(b"Parent") {
            Ok(parent) => node = as_dict(resolve(doc, parent)?)?,
            Err(_) => return Ok(None),
        }
    }

    anyhow::bail!("Page tree deeper than {} levels", MAX_TREE_DEPTH)
}

fn dimension(dict: &Dictionary, key: &[u8]) -> Option<u32> {
    dict.get(key)
        .and_then(Object::as_i64)
        .ok()
        .and_then(|v| u32::try_from(v).ok())
}

fn largest_image<'a>(doc: &'a Document, resources: &'a Dictionary) -> Result<Option<&'a Stream>> {
    let xobjects = match resources.get(b"XObject") {
        Ok(obj) => as_dict(resolve(doc, obj)?)?,
        Err(_) => return Ok(None),
    };

    let mut best: Option<(u64, &Stream)> = None;
    for (name, obj) in xobjects.iter() {
        let Ok(stream) = resolve(doc, obj)?.as_stream() else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .map(|subtype| subtype == b"Image")
            .unwrap_or(false);
        if !is_image {
            continue;
        }

        let (Some(width), Some(height)) = (
            dimension(&stream.dict, b"Width"),
            dimension(&stream.dict, b"Height"),
        ) else {
            continue;
        };
        trace!(
            "Image XObject {}: {}x{}",
            String::from_utf8_lossy(name),
            width,
            height
        );

        let area = u64::from(width) * u64::from(height);
        if best.map_or(true, |(best_area, _)| area > best_area) {
            best = Some((area, stream));
        }
    }

    Ok(best.map(|(_, stream)| stream))
}

fn filter_names(dict: &Dictionary) -> Vec<&[u8]> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.as_slice()],
        Ok(Object::Array(filters)) => filters.iter().filter_map(|f| f.as_name().ok()).collect(),
        _ => Vec::new(),
    }
}

/// Encoded bytes for an image XObject: JPEG passes through, raw 8-bit RGB/gray becomes PNG.
fn encode_image(stream: &Stream) -> Result<Vec<u8>> {
    let filters = filter_names(&stream.dict);

    if matches!(filters.as_slice(), [b"DCTDecode"]) {
        return Ok(stream.content.clone());
    }
    if let Some(unsupported) = filters
        .iter()
        .find(|f| {
            !matches!(
                **f,
                b"FlateDecode" | b"LZWDecode" | b"ASCII85Decode" | b"ASCIIHexDecode"
            )
        })
    {
        anyhow::bail!(
            "unsupported image encoding: {}",
            String::from_utf8_lossy(unsupported)
        );
    }

    let data = if filters.is_empty() {
        stream.content.clone()
    } else {
        stream
            .decompressed_content()
            .map_err(|e| anyhow!("Failed to decompress image: {}", e))?
    };

    let width = dimension(&stream.dict, b"Width").context("image has no width")?;
    let height = dimension(&stream.dict, b"Height").context("image has no height")?;
    let bits = stream
        .dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .unwrap_or(8);
    if bits != 8 {
        anyhow::bail!("unsupported bits per component: {}", bits);
    }

    let color_space = stream.dict.get(b"ColorSpace").and_then(Object::as_name).ok();
    let image = match color_space {
        Some(b"DeviceRGB") => raw_pixels(data, width, height, 3)
            .and_then(|px| RgbImage::from_raw(width, height, px))
            .map(DynamicImage::ImageRgb8),
        Some(b"DeviceGray") => raw_pixels(data, width, height, 1)
            .and_then(|px| GrayImage::from_raw(width, height, px))
            .map(DynamicImage::ImageLuma8),
        other => anyhow::bail!(
            "unsupported color space: {}",
            other.map(String::from_utf8_lossy).unwrap_or_default()
        ),
    }
    .context("image data shorter than its dimensions")?;

    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
        .context("Failed to encode page image")?;
    Ok(out)
}

fn raw_pixels(mut data: Vec<u8>, width: u32, height: u32, channels: usize) -> Option<Vec<u8>> {
    let expected = (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(channels)?;
    if data.len() < expected {
        return None;
    }
    data.truncate(expected);
    Some(data)
}
