//! The block-map ("bmap") model and its XML codec.
//!
//! A bmap describes which blocks of an image hold meaningful data, with a
//! content digest per range and a self-checksum over the serialized document.
//! The self-checksum is computed over the document with its own hex string
//! replaced by ASCII zeros, so the parser must work on the raw bytes rather
//! than a decoded tree: it locates the declared digest in the original text,
//! zeroes it, and re-hashes.
//!
//! Documents with a `version` of `1.x` use the legacy SHA-1 profile
//! (`BmapFileSHA1` element, `sha1` range attribute); `2.x` documents carry a
//! `ChecksumType` and the generic `BmapFileChecksum` / `chksum` names.

pub mod create;

pub use create::{create, CreateOptions};

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// Default block size when none is requested.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Digest algorithm named by a bmap document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumType {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sha1" => Ok(ChecksumType::Sha1),
            "sha256" => Ok(ChecksumType::Sha256),
            "sha512" => Ok(ChecksumType::Sha512),
            other => Err(Error::UnsupportedChecksum(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumType::Sha1 => 40,
            ChecksumType::Sha256 => 64,
            ChecksumType::Sha512 => 128,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            ChecksumType::Sha1 => Hasher::Sha1(Sha1::new()),
            ChecksumType::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumType::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

/// A streaming digest for whichever algorithm the bmap declares.
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finish_hex(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// A contiguous span of mapped blocks, inclusive on both ends, with the hex
/// digest of its byte content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
    pub checksum: String,
}

impl BlockRange {
    pub fn blocks(&self) -> u64 {
        self.end - self.start + 1
    }

    /// The `N` / `N-M` notation used in the document.
    fn text(&self) -> String {
        if self.start == self.end {
            format!("{}", self.start)
        } else {
            format!("{}-{}", self.start, self.end)
        }
    }
}

/// The parsed (or generated) block map of one image.
///
/// Immutable after creation; the self-checksum is a wire artifact computed
/// during [`Bmap::to_xml`] and checked during [`Bmap::parse`], not part of
/// the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bmap {
    pub version: String,
    pub image_size: u64,
    pub block_size: u64,
    pub blocks_count: u64,
    pub mapped_blocks_count: u64,
    pub checksum_type: ChecksumType,
    pub ranges: Vec<BlockRange>,
}

impl Bmap {
    /// Byte count a range actually covers, capped to the image size so the
    /// trailing partial block is not over-counted.
    pub fn range_byte_count(&self, range: &BlockRange) -> u64 {
        let start = range.start * self.block_size;
        let end = ((range.end + 1) * self.block_size).min(self.image_size);
        end - start
    }

    /// Total bytes the copy loop will move: all mapped blocks, minus the
    /// padding of a partially covered final block.
    pub fn mapped_byte_count(&self) -> u64 {
        let mut total = self.mapped_blocks_count * self.block_size;
        if self.image_size % self.block_size != 0 {
            let last_block = self.blocks_count - 1;
            if self.ranges.iter().any(|r| r.end == last_block) {
                total -= self.blocks_count * self.block_size - self.image_size;
            }
        }
        total
    }

    /// Parse a bmap document and verify its self-checksum.
    pub fn parse(content: &[u8]) -> Result<Bmap> {
        let doc = std::str::from_utf8(content)
            .map_err(|_| Error::BmapParse("document is not valid UTF-8".into()))?;

        let version = bmap_version(doc)?;
        let image_size = required_u64(doc, "ImageSize")?;
        let block_size = optional_u64(doc, "BlockSize")?.unwrap_or(DEFAULT_BLOCK_SIZE);
        let blocks_count = required_u64(doc, "BlocksCount")?;
        let mapped_blocks_count = required_u64(doc, "MappedBlocksCount")?;

        if block_size == 0 {
            return Err(Error::BmapParse("BlockSize must be non-zero".into()));
        }

        let modern_checksum = tag_text(doc, "BmapFileChecksum").map(str::trim);
        let legacy_checksum = tag_text(doc, "BmapFileSHA1").map(str::trim);

        let checksum_type = match tag_text(doc, "ChecksumType") {
            Some(name) => ChecksumType::from_name(name.trim())?,
            None if legacy_checksum.is_some() => ChecksumType::Sha1,
            None => {
                return Err(Error::BmapParse(
                    "missing ChecksumType and no legacy SHA-1 field".into(),
                ));
            }
        };

        // Self-verification: prefer the modern field, fall back to the
        // legacy SHA-1 one. The declared digest is zeroed in a byte-exact
        // copy of the document, which is then hashed and compared.
        let declared = match (modern_checksum, legacy_checksum) {
            (Some(c), _) if !c.is_empty() => Some((c, checksum_type)),
            (_, Some(c)) if !c.is_empty() => Some((c, ChecksumType::Sha1)),
            _ => None,
        };
        if let Some((declared_hex, algo)) = declared {
            verify_self_checksum(content, declared_hex, algo)?;
        }

        let ranges = parse_ranges(doc, version.starts_with("1."))?;
        let bmap = Bmap {
            version,
            image_size,
            block_size,
            blocks_count,
            mapped_blocks_count,
            checksum_type,
            ranges,
        };
        bmap.validate()?;
        Ok(bmap)
    }

    /// Structural invariants beyond what the grammar enforces.
    fn validate(&self) -> Result<()> {
        let mut covered = 0u64;
        let mut previous_end: Option<u64> = None;
        for range in &self.ranges {
            if range.end >= self.blocks_count {
                return Err(Error::BmapParse(format!(
                    "range {} exceeds BlocksCount {}",
                    range.text(),
                    self.blocks_count
                )));
            }
            if let Some(prev) = previous_end {
                if range.start <= prev {
                    return Err(Error::BmapParse(format!(
                        "range {} is out of order or overlaps its predecessor",
                        range.text()
                    )));
                }
            }
            if range.checksum.len() != self.checksum_type.hex_len() {
                return Err(Error::BmapParse(format!(
                    "range {} checksum length {} does not match {}",
                    range.text(),
                    range.checksum.len(),
                    self.checksum_type.name()
                )));
            }
            covered += range.blocks();
            previous_end = Some(range.end);
        }
        if covered != self.mapped_blocks_count {
            return Err(Error::BmapParse(format!(
                "ranges cover {} blocks but MappedBlocksCount is {}",
                covered, self.mapped_blocks_count
            )));
        }
        Ok(())
    }

    /// Serialize to the XML document, self-checksum included.
    ///
    /// The document is first assembled with the checksum field holding ASCII
    /// zeros, hashed, and the digest is then spliced over the placeholder.
    pub fn to_xml(&self) -> String {
        let legacy = self.checksum_type == ChecksumType::Sha1 && self.version.starts_with("1.");
        let range_attr = if legacy { "sha1" } else { "chksum" };
        let checksum_tag = if legacy { "BmapFileSHA1" } else { "BmapFileChecksum" };

        let mut prefix = String::new();
        prefix.push_str("<?xml version=\"1.0\" ?>\n");
        prefix.push_str(&format!(
            "<!-- Bmap for image {} bytes, mapped {} blocks -->\n",
            self.image_size, self.mapped_blocks_count
        ));
        prefix.push_str(&format!("<bmap version=\"{}\">\n", self.version));
        prefix.push_str(&format!("    <ImageSize> {} </ImageSize>\n", self.image_size));
        prefix.push_str(&format!("    <BlockSize> {} </BlockSize>\n", self.block_size));
        prefix.push_str(&format!(
            "    <BlocksCount> {} </BlocksCount>\n",
            self.blocks_count
        ));
        prefix.push_str(&format!(
            "    <MappedBlocksCount> {} </MappedBlocksCount>\n",
            self.mapped_blocks_count
        ));
        if !legacy {
            prefix.push_str(&format!(
                "    <ChecksumType> {} </ChecksumType>\n",
                self.checksum_type.name()
            ));
        }
        prefix.push_str(&format!("    <{}> ", checksum_tag));

        let mut suffix = String::new();
        suffix.push_str(&format!(" </{}>\n", checksum_tag));
        suffix.push_str("    <BlockMap>\n");
        for range in &self.ranges {
            suffix.push_str(&format!(
                "        <Range {}=\"{}\"> {} </Range>\n",
                range_attr,
                range.checksum,
                range.text()
            ));
        }
        suffix.push_str("    </BlockMap>\n");
        suffix.push_str("</bmap>\n");

        let placeholder = "0".repeat(self.checksum_type.hex_len());
        let mut hasher = self.checksum_type.hasher();
        hasher.update(prefix.as_bytes());
        hasher.update(placeholder.as_bytes());
        hasher.update(suffix.as_bytes());
        let digest = hasher.finish_hex();

        let mut out = prefix;
        out.push_str(&digest);
        out.push_str(&suffix);
        out
    }

    /// Write the serialized document to `path`.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        std::fs::write(path, self.to_xml())?;
        Ok(())
    }
}

fn verify_self_checksum(content: &[u8], declared_hex: &str, algo: ChecksumType) -> Result<()> {
    if declared_hex.len() != algo.hex_len() {
        return Err(Error::BmapIntegrity(format!(
            "declared checksum length {} does not match {}",
            declared_hex.len(),
            algo.name()
        )));
    }
    let pos = find_subslice(content, declared_hex.as_bytes()).ok_or_else(|| {
        Error::BmapIntegrity("checksum string not found in the document".into())
    })?;

    let mut zeroed = content.to_vec();
    zeroed[pos..pos + declared_hex.len()].fill(b'0');

    let mut hasher = algo.hasher();
    hasher.update(&zeroed);
    let actual = hasher.finish_hex();

    if actual != declared_hex {
        return Err(Error::BmapIntegrity(format!(
            "checksum mismatch: expected {}, got {}",
            declared_hex, actual
        )));
    }
    Ok(())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn bmap_version(doc: &str) -> Result<String> {
    let open = doc
        .find("<bmap")
        .ok_or_else(|| Error::BmapParse("missing <bmap> root element".into()))?;
    let rest = &doc[open..];
    let element_end = rest
        .find('>')
        .ok_or_else(|| Error::BmapParse("unterminated <bmap> element".into()))?;
    let element = &rest[..element_end];
    let attr = element
        .find("version=\"")
        .ok_or_else(|| Error::BmapParse("missing version attribute".into()))?;
    let value = &element[attr + "version=\"".len()..];
    let close = value
        .find('"')
        .ok_or_else(|| Error::BmapParse("unterminated version attribute".into()))?;
    Ok(value[..close].trim().to_string())
}

/// Text between `<tag>` and `</tag>`, untrimmed.
fn tag_text<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = doc.find(&open)? + open.len();
    let end = doc[start..].find(&close)? + start;
    Some(&doc[start..end])
}

fn required_u64(doc: &str, tag: &str) -> Result<u64> {
    let text = tag_text(doc, tag)
        .ok_or_else(|| Error::BmapParse(format!("missing <{}> element", tag)))?;
    parse_u64(text, tag)
}

fn optional_u64(doc: &str, tag: &str) -> Result<Option<u64>> {
    match tag_text(doc, tag) {
        Some(text) => parse_u64(text, tag).map(Some),
        None => Ok(None),
    }
}

fn parse_u64(text: &str, tag: &str) -> Result<u64> {
    text.trim()
        .parse::<u64>()
        .map_err(|e| Error::BmapParse(format!("invalid <{}> value '{}': {}", tag, text.trim(), e)))
}

fn parse_ranges(doc: &str, legacy: bool) -> Result<Vec<BlockRange>> {
    let attr_name = if legacy { "sha1=\"" } else { "chksum=\"" };
    let mut ranges = Vec::new();
    let mut cursor = 0;

    while let Some(found) = doc[cursor..].find("<Range") {
        let element_start = cursor + found;
        let rest = &doc[element_start..];
        let text_start = rest.find('>').ok_or_else(|| {
            Error::BmapParse("unterminated <Range> element".into())
        })? + 1;
        let text_end = rest.find("</Range>").ok_or_else(|| {
            Error::BmapParse("missing </Range> close tag".into())
        })?;
        if text_end < text_start {
            return Err(Error::BmapParse("malformed <Range> element".into()));
        }

        let open_tag = &rest[..text_start];
        let checksum = extract_attr(open_tag, attr_name)
            .or_else(|| extract_attr(open_tag, "chksum=\""))
            .or_else(|| extract_attr(open_tag, "sha1=\""))
            .ok_or_else(|| Error::BmapParse("range missing checksum attribute".into()))?;

        let text = rest[text_start..text_end].trim();
        let (start, end) = parse_range_text(text)?;
        ranges.push(BlockRange {
            start,
            end,
            checksum: checksum.to_string(),
        });

        cursor = element_start + text_end + "</Range>".len();
    }

    Ok(ranges)
}

fn extract_attr<'a>(open_tag: &'a str, marker: &str) -> Option<&'a str> {
    let start = open_tag.find(marker)? + marker.len();
    let rest = &open_tag[start..];
    let end = rest.find('"')?;
    Some(rest[..end].trim())
}

/// Decode `N` or `N-M` range text.
fn parse_range_text(text: &str) -> Result<(u64, u64)> {
    let range_err = |reason: &str| Error::BmapRangeParse {
        text: text.to_string(),
        reason: reason.to_string(),
    };

    match text.split_once('-') {
        None => {
            let block = text
                .trim()
                .parse::<u64>()
                .map_err(|_| range_err("not a block number"))?;
            Ok((block, block))
        }
        Some((first, second)) => {
            let start = first
                .trim()
                .parse::<u64>()
                .map_err(|_| range_err("invalid start block"))?;
            let end = second
                .trim()
                .parse::<u64>()
                .map_err(|_| range_err("invalid end block"))?;
            if start > end {
                return Err(range_err("start block is greater than end block"));
            }
            Ok((start, end))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bmap() -> Bmap {
        Bmap {
            version: "2.0".to_string(),
            image_size: 821_752,
            block_size: 4096,
            blocks_count: 201,
            mapped_blocks_count: 4,
            checksum_type: ChecksumType::Sha256,
            ranges: vec![
                BlockRange {
                    start: 0,
                    end: 1,
                    checksum: "9eaf19215d55d23de1be1fe4bed4a95bfe620a404352fd06e782738fff58e500"
                        .to_string(),
                },
                BlockRange {
                    start: 5,
                    end: 6,
                    checksum: "16bb9d30e7a8b9a4e85a2eaa63e9deba23b6c80a9c54418f6e9a60fc5f17f30b"
                        .to_string(),
                },
            ],
        }
    }

    #[test]
    fn serialize_parse_round_trip() {
        let bmap = sample_bmap();
        let xml = bmap.to_xml();
        let parsed = Bmap::parse(xml.as_bytes()).expect("round trip parse");
        assert_eq!(parsed, bmap);
    }

    #[test]
    fn tampering_outside_checksum_is_detected() {
        let xml = sample_bmap().to_xml();
        let corrupted = xml.replace("<BlocksCount> 201 </BlocksCount>", "<BlocksCount> 202 </BlocksCount>");
        assert_ne!(xml, corrupted);
        match Bmap::parse(corrupted.as_bytes()) {
            Err(Error::BmapIntegrity(_)) => {}
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn tampering_every_byte_outside_checksum_is_detected() {
        let bmap = Bmap {
            ranges: vec![sample_bmap().ranges[0].clone()],
            mapped_blocks_count: 2,
            ..sample_bmap()
        };
        let xml = bmap.to_xml().into_bytes();
        let digest = {
            // The digest is the only 64-char hex run between the checksum tags.
            let text = String::from_utf8(xml.clone()).unwrap();
            let start = text.find("<BmapFileChecksum> ").unwrap() + "<BmapFileChecksum> ".len();
            start..start + 64
        };

        // Flip a digit character in a handful of positions spread over the
        // document; every mutation outside the digest must fail integrity.
        for pos in [40usize, 100, 200, xml.len() - 3] {
            if digest.contains(&pos) {
                continue;
            }
            let mut copy = xml.clone();
            copy[pos] = if copy[pos] == b'7' { b'8' } else { b'7' };
            assert!(
                matches!(Bmap::parse(&copy), Err(Error::BmapIntegrity(_) | Error::BmapParse(_))),
                "mutation at byte {} was not rejected",
                pos
            );
        }
    }

    #[test]
    fn modified_checksum_is_detected() {
        let xml = sample_bmap().to_xml();
        let start = xml.find("<BmapFileChecksum> ").unwrap() + "<BmapFileChecksum> ".len();
        let original = &xml[start..start + 64];
        let flipped = if original.starts_with('a') {
            format!("b{}", &original[1..])
        } else {
            format!("a{}", &original[1..])
        };
        let corrupted = xml.replace(original, &flipped);
        assert!(matches!(
            Bmap::parse(corrupted.as_bytes()),
            Err(Error::BmapIntegrity(_))
        ));
    }

    #[test]
    fn legacy_sha1_profile_parses() {
        let bmap = Bmap {
            version: "1.3".to_string(),
            image_size: 8192,
            block_size: 4096,
            blocks_count: 2,
            mapped_blocks_count: 1,
            checksum_type: ChecksumType::Sha1,
            ranges: vec![BlockRange {
                start: 0,
                end: 0,
                checksum: "a".repeat(40),
            }],
        };
        let xml = bmap.to_xml();
        assert!(xml.contains("<BmapFileSHA1>"));
        assert!(xml.contains("sha1=\""));
        assert!(!xml.contains("ChecksumType"));

        let parsed = Bmap::parse(xml.as_bytes()).expect("legacy parse");
        assert_eq!(parsed, bmap);
    }

    #[test]
    fn whitespace_around_values_is_trimmed() {
        // The serializer pads every value with spaces; the parser must strip
        // them on every text leaf, attributes included.
        let parsed = Bmap::parse(sample_bmap().to_xml().as_bytes()).unwrap();
        assert_eq!(parsed.image_size, 821_752);
        assert_eq!(parsed.checksum_type, ChecksumType::Sha256);
        assert_eq!(parsed.ranges[0].checksum.len(), 64);
    }

    #[test]
    fn range_text_forms() {
        assert_eq!(parse_range_text("42").unwrap(), (42, 42));
        assert_eq!(parse_range_text("256-1805").unwrap(), (256, 1805));
        assert!(matches!(
            parse_range_text("7-3"),
            Err(Error::BmapRangeParse { .. })
        ));
        assert!(matches!(
            parse_range_text("x-3"),
            Err(Error::BmapRangeParse { .. })
        ));
        assert!(matches!(
            parse_range_text(""),
            Err(Error::BmapRangeParse { .. })
        ));
    }

    #[test]
    fn out_of_order_ranges_are_rejected() {
        let mut bmap = sample_bmap();
        bmap.ranges.swap(0, 1);
        let xml = bmap.to_xml();
        assert!(matches!(
            Bmap::parse(xml.as_bytes()),
            Err(Error::BmapParse(_))
        ));
    }

    #[test]
    fn mapped_count_mismatch_is_rejected() {
        let mut bmap = sample_bmap();
        bmap.mapped_blocks_count = 7;
        let xml = bmap.to_xml();
        assert!(matches!(
            Bmap::parse(xml.as_bytes()),
            Err(Error::BmapParse(_))
        ));
    }

    #[test]
    fn range_past_blocks_count_is_rejected() {
        let mut bmap = sample_bmap();
        bmap.ranges[1].end = 600;
        bmap.mapped_blocks_count = 2 + 596;
        let xml = bmap.to_xml();
        assert!(matches!(
            Bmap::parse(xml.as_bytes()),
            Err(Error::BmapParse(_))
        ));
    }

    #[test]
    fn mapped_byte_count_subtracts_final_padding() {
        // 6144-byte image over 4096-byte blocks: two blocks, the second only
        // half covered. A map covering both blocks moves 6144 bytes.
        let bmap = Bmap {
            version: "2.0".into(),
            image_size: 6144,
            block_size: 4096,
            blocks_count: 2,
            mapped_blocks_count: 2,
            checksum_type: ChecksumType::Sha256,
            ranges: vec![BlockRange {
                start: 0,
                end: 1,
                checksum: "0".repeat(64),
            }],
        };
        assert_eq!(bmap.mapped_byte_count(), 6144);
        assert_eq!(bmap.range_byte_count(&bmap.ranges[0]), 6144);
    }
}
