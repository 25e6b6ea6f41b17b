use std::fs;
use std::io;
use std::path::Path;

pub const COMPRESSED_SUFFIX: &str = ".zst";
const TAPE_COMPRESSION_LEVEL: i32 = 0;

pub fn is_compressed(path: &Path) -> bool {
    path.to_string_lossy().ends_with(COMPRESSED_SUFFIX)
}

pub fn compress_jsonl(input: &str) -> io::Result<Vec<u8>> {
    zstd::stream::encode_all(input.as_bytes(), TAPE_COMPRESSION_LEVEL)
}

pub fn decompress_jsonl(input: &[u8]) -> io::Result<String> {
    let decompressed = zstd::stream::decode_all(input)?;
    String::from_utf8(decompressed).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Reads a tape as text, inflating it when the file name ends in `.zst`.
pub fn read_tape_text(path: &Path) -> io::Result<String> {
    if is_compressed(path) {
        decompress_jsonl(&fs::read(path)?)
    } else {
        fs::read_to_string(path)
    }
}

pub fn write_tape_text(path: &Path, jsonl: &str) -> io::Result<()> {
    if is_compressed(path) {
        fs::write(path, compress_jsonl(jsonl)?)
    } else {
        fs::write(path, jsonl)
    }
}
