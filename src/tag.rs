//! Tag-writing collaborators. Both fill only fields that are currently
//! empty and never overwrite what the recovered audio already carries.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

const PNG_HEADER: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// MIME type marking a picture whose data is a URL rather than image bytes.
pub const LINK_MIME: &str = "-->";

const COVER_DESCRIPTION: &str = "Front cover";

#[derive(Error, Debug)]
pub enum TagError {
    #[error("id3: {0}")]
    Id3(#[from] id3::Error),

    #[error("flac: {0}")]
    Flac(#[from] metaflac::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cover {
    Image(Vec<u8>),
    /// Remote reference stored as text when no bytes could be had.
    Link(String),
}

impl Cover {
    fn mime_and_data(&self) -> (&'static str, Vec<u8>) {
        match self {
            Cover::Image(data) => (album_image_mime_type(data), data.clone()),
            Cover::Link(url) => (LINK_MIME, url.as_bytes().to_vec()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFields {
    pub title: String,
    pub album: String,
    pub artists: Vec<String>,
    pub cover: Option<Cover>,
}

pub trait TagWriter: Send + Sync {
    fn write_tags(&self, path: &Path, fields: &TagFields) -> Result<(), TagError>;
}

pub fn album_image_mime_type(image: &[u8]) -> &'static str {
    if image.starts_with(&PNG_HEADER) {
        "image/png"
    } else {
        "image/jpeg"
    }
}

/// ID3v2 tags for `mp3` output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Id3Writer;

impl TagWriter for Id3Writer {
    fn write_tags(&self, path: &Path, fields: &TagFields) -> Result<(), TagError> {
        use id3::frame::{Picture, PictureType};
        use id3::TagLike;

        let mut tag = match id3::Tag::read_from_path(path) {
            Ok(tag) => tag,
            Err(e) if matches!(e.kind, id3::ErrorKind::NoTag) => id3::Tag::new(),
            Err(e) => return Err(e.into()),
        };

        if tag.title().map_or(true, str::is_empty) && !fields.title.is_empty() {
            debug!("adding title");
            tag.set_title(fields.title.clone());
        }

        if tag.album().map_or(true, str::is_empty) && !fields.album.is_empty() {
            debug!("adding album");
            tag.set_album(fields.album.clone());
        }

        if tag.artist().map_or(true, str::is_empty) && !fields.artists.is_empty() {
            debug!("adding artist");
            // ID3v2.4 separates the values of a text frame with NUL.
            tag.set_artist(fields.artists.join("\0"));
        }

        let has_cover = tag
            .pictures()
            .any(|picture| matches!(picture.picture_type, PictureType::CoverFront));
        if let (false, Some(cover)) = (has_cover, &fields.cover) {
            let (mime_type, data) = cover.mime_and_data();
            tag.add_frame(Picture {
                mime_type: mime_type.to_string(),
                picture_type: PictureType::CoverFront,
                description: COVER_DESCRIPTION.to_string(),
                data,
            });
        }

        tag.write_to_path(path, id3::Version::Id3v24)?;
        Ok(())
    }
}

/// Vorbis comments and a picture block for `flac` output.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlacWriter;

impl TagWriter for FlacWriter {
    fn write_tags(&self, path: &Path, fields: &TagFields) -> Result<(), TagError> {
        use metaflac::block::PictureType;

        let mut tag = metaflac::Tag::read_from_path(path)?;

        let is_empty = |values: Option<&Vec<String>>| {
            values.map_or(true, |values| values.iter().all(String::is_empty))
        };

        let existing = tag.vorbis_comments();
        let need_title = is_empty(existing.and_then(|c| c.title()));
        let need_album = is_empty(existing.and_then(|c| c.album()));
        let need_artist = is_empty(existing.and_then(|c| c.artist()));

        let comments = tag.vorbis_comments_mut();
        if need_title && !fields.title.is_empty() {
            debug!("adding title");
            comments.set_title(vec![fields.title.clone()]);
        }
        if need_album && !fields.album.is_empty() {
            debug!("adding album");
            comments.set_album(vec![fields.album.clone()]);
        }
        if need_artist && !fields.artists.is_empty() {
            debug!("adding artist");
            comments.set_artist(fields.artists.clone());
        }

        let has_cover = tag
            .pictures()
            .any(|picture| matches!(picture.picture_type, PictureType::CoverFront));
        if let (false, Some(cover)) = (has_cover, &fields.cover) {
            let (mime_type, data) = cover.mime_and_data();
            tag.add_picture(mime_type, PictureType::CoverFront, data);
        }

        tag.write_to_path(path)?;
        Ok(())
    }
}
