//! Recovery of the audio wrapped in an ncm container.
//!
//! Per file the work is strictly sequential: read the container, decode the
//! key block, decode the metadata block, build the key box, stream the
//! payload into the output file and finally hand the metadata to a tag
//! writer.

pub mod audio;
pub mod container;
pub mod crypto;
pub mod key;
pub mod keybox;
pub mod meta;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub use self::audio::music_data;
pub use self::container::{read_container, NcmContainer};
pub use self::key::decode_key_block;
pub use self::keybox::KeyBox;
pub use self::meta::{decode_meta_block, Artist, NcmId, TrackMetadata};

use crate::cover::CoverFetcher;
use crate::error::{NcmError, Result};
use crate::tag::{Cover, FlacWriter, Id3Writer, TagFields, TagWriter};

/// Secret for the key block.
pub const CORE_KEY: [u8; 16] = [
    0x68, 0x7A, 0x48, 0x52, 0x41, 0x6D, 0x73, 0x6F, 0x35, 0x6B, 0x49, 0x6E, 0x62, 0x61, 0x78, 0x57,
];
/// Secret for the metadata block.
pub const META_KEY: [u8; 16] = [
    0x23, 0x31, 0x34, 0x6C, 0x6A, 0x6B, 0x5F, 0x21, 0x5C, 0x5D, 0x26, 0x30, 0x55, 0x3C, 0x27, 0x28,
];

const FALLBACK_FORMAT: &str = "mp3";

/// Recovered bytes needed to tell the known formats apart.
const SNIFF_LEN: usize = 4;

/// The pair of block secrets a container was produced against.
#[derive(Clone)]
pub struct Engine {
    core_key: [u8; 16],
    meta_key: [u8; 16],
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(CORE_KEY, META_KEY)
    }
}

impl Engine {
    pub fn new(core_key: [u8; 16], meta_key: [u8; 16]) -> Self {
        Engine { core_key, meta_key }
    }

    pub fn decode_key_block(&self, raw: &[u8]) -> Result<Vec<u8>> {
        decode_key_block(raw, &self.core_key)
    }

    pub fn decode_meta_block(&self, raw: &[u8]) -> Result<TrackMetadata> {
        decode_meta_block(raw, &self.meta_key)
    }
}

/// What one successful run produced.
#[derive(Debug)]
pub struct Unboxed {
    pub output: PathBuf,
    pub audio_len: u64,
    /// `None` when the metadata block could not be parsed.
    pub metadata: Option<TrackMetadata>,
    pub tagged: bool,
}

/// Drives one file through the whole pipeline. Holds no per-file state, so a
/// single instance can serve many files concurrently.
pub struct Unboxer {
    engine: Engine,
    mp3: Box<dyn TagWriter>,
    flac: Box<dyn TagWriter>,
    fetcher: Option<Box<dyn CoverFetcher>>,
}

impl Default for Unboxer {
    fn default() -> Self {
        Unboxer::new(Engine::default())
    }
}

impl Unboxer {
    pub fn new(engine: Engine) -> Self {
        Unboxer {
            engine,
            mp3: Box::new(Id3Writer),
            flac: Box::new(FlacWriter),
            fetcher: None,
        }
    }

    pub fn with_tag_writers(mut self, mp3: Box<dyn TagWriter>, flac: Box<dyn TagWriter>) -> Self {
        self.mp3 = mp3;
        self.flac = flac;
        self
    }

    pub fn with_cover_fetcher(mut self, fetcher: Box<dyn CoverFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Recovers `input` into `output_dir`, naming the result after the input
    /// with its extension replaced by the track's format.
    pub fn unboxing(&self, input: &Path, output_dir: &Path) -> Result<Unboxed> {
        let input_file = File::open(input).map_err(NcmError::Read)?;

        let mut container = read_container(BufReader::new(input_file))?;

        let key = self.engine.decode_key_block(&container.key_block)?;

        let metadata = match self.engine.decode_meta_block(&container.meta_block) {
            Ok(meta) => Some(meta),
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "tags will not be written");
                None
            }
            Err(e) => return Err(e),
        };

        let key_box = KeyBox::ksa(&key)?;

        let (format, head) = match &metadata {
            Some(meta) => (meta.format.clone(), Vec::new()),
            None => {
                let head = read_head(&mut container.audio)?;
                (sniff_format(&key_box, &head).to_string(), head)
            }
        };

        let output = output_path(input, output_dir, &format);
        if is_same_file(input, &output) {
            return Err(NcmError::Write(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} would overwrite its input", output.display()),
            )));
        }
        debug!(output = %output.display(), "writing");

        let output_file = File::create(&output).map_err(NcmError::Write)?;
        let mut writer = BufWriter::new(output_file);

        // Head bytes go first so keystream offsets start at 0.
        let mut audio = Cursor::new(head).chain(&mut container.audio);
        let audio_len = music_data(&key_box, &mut audio, &mut writer)?;
        drop(writer);

        info!(output = %output.display(), bytes = audio_len, "recovered");

        let tagged = match &metadata {
            Some(meta) => self.combine_file(meta, &output, container.image.take()),
            None => false,
        };

        Ok(Unboxed {
            output,
            audio_len,
            metadata,
            tagged,
        })
    }

    fn combine_file(&self, meta: &TrackMetadata, output: &Path, image: Option<Vec<u8>>) -> bool {
        let writer = match meta.format.as_str() {
            "mp3" => &self.mp3,
            "flac" => &self.flac,
            other => {
                info!(format = other, "no tag writer for format, leaving untagged");
                return false;
            }
        };

        let fields = TagFields {
            title: meta.music_name.clone(),
            album: meta.album.clone(),
            artists: meta.artist_names(),
            cover: self.album_cover(meta, image),
        };

        match writer.write_tags(output, &fields) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, output = %output.display(), "failed to write tags");
                false
            }
        }
    }

    fn album_cover(&self, meta: &TrackMetadata, image: Option<Vec<u8>>) -> Option<Cover> {
        if let Some(image) = image {
            return Some(Cover::Image(image));
        }

        if meta.album_pic.is_empty() {
            return None;
        }

        if let Some(fetcher) = &self.fetcher {
            match fetcher.fetch(&meta.album_pic) {
                Ok(image) => return Some(Cover::Image(image)),
                Err(e) => warn!(error = %e, url = %meta.album_pic, "failed to download album pic"),
            }
        }

        Some(Cover::Link(meta.album_pic.clone()))
    }
}

fn output_path(input: &Path, output_dir: &Path, format: &str) -> PathBuf {
    let mut name = input.file_stem().unwrap_or(input.as_os_str()).to_os_string();
    name.push(".");
    name.push(format);
    output_dir.join(name)
}

fn is_same_file(input: &Path, output: &Path) -> bool {
    match (std::fs::canonicalize(input), std::fs::canonicalize(output)) {
        (Ok(input), Ok(output)) => input == output,
        _ => false,
    }
}

/// Reads the first scrambled payload bytes, fewer only when the payload is
/// shorter.
fn read_head<R: Read>(audio: &mut R) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    audio
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .map_err(NcmError::Read)?;
    Ok(head)
}

/// Guesses the audio format from the scrambled start of the payload.
fn sniff_format(key_box: &KeyBox, scrambled_head: &[u8]) -> &'static str {
    let mut head = scrambled_head.to_vec();
    key_box.prga(&mut head, 0);

    match head.as_slice() {
        [b'f', b'L', b'a', b'C', ..] => "flac",
        [b'I', b'D', b'3', ..] => "mp3",
        [0xFF, b, ..] if b & 0xE0 == 0xE0 => "mp3",
        _ => FALLBACK_FORMAT,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cover::CoverError;
    use crate::tag::TagError;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(PathBuf, TagFields)>>>);

    impl TagWriter for Recorder {
        fn write_tags(&self, path: &Path, fields: &TagFields) -> std::result::Result<(), TagError> {
            self.0.lock().unwrap().push((path.to_path_buf(), fields.clone()));
            Ok(())
        }
    }

    struct FailingFetcher;

    impl CoverFetcher for FailingFetcher {
        fn fetch(&self, _url: &str) -> std::result::Result<Vec<u8>, CoverError> {
            Err(CoverError::Status(reqwest::StatusCode::NOT_FOUND))
        }
    }

    struct FixedFetcher(Vec<u8>);

    impl CoverFetcher for FixedFetcher {
        fn fetch(&self, _url: &str) -> std::result::Result<Vec<u8>, CoverError> {
            Ok(self.0.clone())
        }
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ncm-dump-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const KEY_MATERIAL: &[u8] = b"123456789012345E7fT49x7dof9OKCgg9cdvhEuezy3iZCL1nFvBFd1T4uSktAJKmwZXsijPbijliionVUXXg9plTbXEclAE9Lb";

    fn scramble(plain: &[u8]) -> Vec<u8> {
        let mut data = plain.to_vec();
        KeyBox::ksa(KEY_MATERIAL).unwrap().prga(&mut data, 0);
        data
    }

    fn build(dir: &Path, name: &str, meta_json: Option<&str>, image: &[u8], audio: &[u8]) -> PathBuf {
        let key = key::encode_key_block(KEY_MATERIAL, &CORE_KEY);
        let meta = match meta_json {
            Some(json) => meta::encode_meta_block(json, &META_KEY),
            None => b"garbage".to_vec(),
        };
        let bytes = container::write_container(&key, &meta, image, &scramble(audio));
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn source_audio() -> Vec<u8> {
        let mut audio = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
        audio.extend((0..100_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8));
        audio
    }

    #[test]
    fn end_to_end() {
        let dir = scratch("e2e");
        let audio = source_audio();
        let input = build(
            &dir,
            "song.ncm",
            Some(r#"{"musicName":"T","album":"A","artist":[["X",1]],"format":"mp3"}"#),
            b"\x89PNG\r\n\x1a\nfake",
            &audio,
        );

        let recorder = Recorder::default();
        let unboxer = Unboxer::default().with_tag_writers(Box::new(recorder.clone()), Box::new(Recorder::default()));
        let unboxed = unboxer.unboxing(&input, &dir).unwrap();

        assert_eq!(unboxed.output, dir.join("song.mp3"));
        assert_eq!(unboxed.audio_len, audio.len() as u64);
        assert!(unboxed.tagged);
        assert_eq!(std::fs::read(&unboxed.output).unwrap(), audio);

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (path, fields) = &calls[0];
        assert_eq!(path, &unboxed.output);
        assert_eq!(fields.title, "T");
        assert_eq!(fields.album, "A");
        assert_eq!(fields.artists, vec!["X".to_string()]);
        assert_eq!(fields.cover, Some(Cover::Image(b"\x89PNG\r\n\x1a\nfake".to_vec())));
    }

    #[test]
    fn flac_goes_to_flac_writer_with_link_fallback() {
        let dir = scratch("flac");
        let input = build(
            &dir,
            "track.ncm",
            Some(r#"{"musicName":"T","albumPic":"https://p1.example/c.jpg","format":"flac"}"#),
            b"",
            b"fLaC rest",
        );

        let mp3 = Recorder::default();
        let flac = Recorder::default();
        let unboxer = Unboxer::default()
            .with_tag_writers(Box::new(mp3.clone()), Box::new(flac.clone()))
            .with_cover_fetcher(Box::new(FailingFetcher));
        let unboxed = unboxer.unboxing(&input, &dir).unwrap();

        assert_eq!(unboxed.output, dir.join("track.flac"));
        assert!(mp3.0.lock().unwrap().is_empty());
        let calls = flac.0.lock().unwrap();
        assert_eq!(calls[0].1.cover, Some(Cover::Link("https://p1.example/c.jpg".into())));
    }

    #[test]
    fn fetched_cover_is_embedded() {
        let dir = scratch("fetch");
        let input = build(
            &dir,
            "a.ncm",
            Some(r#"{"albumPic":"https://p1.example/c.jpg","format":"mp3"}"#),
            b"",
            b"ID3",
        );

        let recorder = Recorder::default();
        let unboxer = Unboxer::default()
            .with_tag_writers(Box::new(recorder.clone()), Box::new(Recorder::default()))
            .with_cover_fetcher(Box::new(FixedFetcher(vec![0xFF, 0xD8])));
        unboxer.unboxing(&input, &dir).unwrap();

        assert_eq!(recorder.0.lock().unwrap()[0].1.cover, Some(Cover::Image(vec![0xFF, 0xD8])));
    }

    #[test]
    fn bad_metadata_still_recovers_audio() {
        let dir = scratch("nometa");
        let mut audio = b"fLaC".to_vec();
        audio.extend_from_slice(&[7u8; 5000]);
        let input = build(&dir, "broken.ncm", None, b"", &audio);

        let recorder = Recorder::default();
        let unboxer = Unboxer::default().with_tag_writers(Box::new(recorder.clone()), Box::new(recorder.clone()));
        let unboxed = unboxer.unboxing(&input, &dir).unwrap();

        assert_eq!(unboxed.output, dir.join("broken.flac"));
        assert!(unboxed.metadata.is_none());
        assert!(!unboxed.tagged);
        assert_eq!(std::fs::read(&unboxed.output).unwrap(), audio);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn bad_signature_writes_nothing() {
        let dir = scratch("magic");
        let input = dir.join("fake.ncm");
        std::fs::write(&input, b"RIFF\x00\x00\x00\x00WAVEfmt ").unwrap();

        let err = Unboxer::default().unboxing(&input, &dir).unwrap_err();
        assert!(matches!(err, NcmError::Format(_)));
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn short_key_block_fails_before_output() {
        let dir = scratch("shortkey");
        let key = crypto::xor_mask(&crypto::aes_encode(b"netease", &CORE_KEY), 0x64);
        let meta = meta::encode_meta_block(r#"{"format":"mp3"}"#, &META_KEY);
        let input = dir.join("s.ncm");
        std::fs::write(&input, container::write_container(&key, &meta, b"", b"ID3")).unwrap();

        let err = Unboxer::default().unboxing(&input, &dir).unwrap_err();
        assert!(matches!(err, NcmError::Crypto(_)));
        assert!(!dir.join("s.mp3").exists());
    }

    #[test]
    fn sniffing_falls_back_on_unknown_audio() {
        let key_box = KeyBox::ksa(KEY_MATERIAL).unwrap();
        assert_eq!(sniff_format(&key_box, &scramble(b"OggS")), FALLBACK_FORMAT);
        assert_eq!(sniff_format(&key_box, &scramble(&[0xFF, 0xFB, 0x90])), "mp3");
        assert_eq!(sniff_format(&key_box, &scramble(b"fLaC")), "flac");
        assert_eq!(sniff_format(&key_box, &scramble(b"fL")), FALLBACK_FORMAT);
        assert_eq!(sniff_format(&key_box, &[]), FALLBACK_FORMAT);
    }

    #[test]
    fn sniffing_sees_past_a_read_buffer_boundary() {
        let dir = scratch("boundary");
        let key = key::encode_key_block(KEY_MATERIAL, &CORE_KEY);

        // BufReader holds 8 KiB, so only two payload bytes are buffered once the header is read.
        let bare = container::write_container(&key, b"garbage", b"", b"").len();
        let image = vec![0u8; 8190 - bare];
        assert_eq!(container::write_container(&key, b"garbage", &image, b"").len(), 8190);

        let mut audio = b"fLaC".to_vec();
        audio.extend((0..40_000u32).map(|i| (i % 251) as u8));
        let input = build(&dir, "p.ncm", None, &image, &audio);

        let unboxed = Unboxer::default().unboxing(&input, &dir).unwrap();

        assert_eq!(unboxed.output, dir.join("p.flac"));
        assert_eq!(unboxed.audio_len, audio.len() as u64);
        assert_eq!(std::fs::read(&unboxed.output).unwrap(), audio);
    }

    #[test]
    fn container_format_never_clobbers_input() {
        let dir = scratch("clobber");
        let audio = source_audio();
        let input = build(&dir, "c.ncm", Some(r#"{"musicName":"T","format":"ncm"}"#), b"", &audio);
        let original = std::fs::read(&input).unwrap();

        let unboxer = Unboxer::default().with_tag_writers(Box::new(Recorder::default()), Box::new(Recorder::default()));
        let unboxed = unboxer.unboxing(&input, &dir).unwrap();

        assert_eq!(unboxed.output, dir.join("c.mp3"));
        assert!(unboxed.metadata.is_none());
        assert_eq!(std::fs::read(&unboxed.output).unwrap(), audio);
        assert_eq!(std::fs::read(&input).unwrap(), original);
    }

    #[test]
    fn output_equal_to_input_is_refused() {
        let dir = scratch("same");
        let input = build(&dir, "x.mp3", Some(r#"{"format":"mp3"}"#), b"", b"ID3 payload");
        let original = std::fs::read(&input).unwrap();

        let err = Unboxer::default().unboxing(&input, &dir).unwrap_err();

        assert!(matches!(err, NcmError::Write(_)));
        assert_eq!(std::fs::read(&input).unwrap(), original);
    }

    #[test]
    fn output_path_replaces_extension() {
        assert_eq!(
            output_path(Path::new("/in/Artist - Song.ncm"), Path::new("/out"), "flac"),
            PathBuf::from("/out/Artist - Song.flac")
        );
        assert_eq!(
            output_path(Path::new("/in/a.b.ncm"), Path::new("/out"), "mp3"),
            PathBuf::from("/out/a.b.mp3")
        );
    }
}
