//! Read-only space backed by a pre-built memory-mapped image of objects.
//!
//! Image content is immutable after load, so the space keeps a single
//! bitmap: the mark accessor aliases the live one by design, which spares
//! the collector a special case for objects that are always live.

use crate::accounting::space_bitmap::SpaceBitmap;
use crate::mem_map::{MemMap, PROT_READ};
use crate::spaces::{GcRetentionPolicy, Space};
use crate::utils::*;
use crate::OBJECT_ALIGNMENT;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

pub const IMAGE_MAGIC: [u8; 8] = *b"HEAPIMG\0";
pub const IMAGE_VERSION: u32 = 1;

/// Fixed-layout descriptor at offset 0 of every image file. All fields are
/// little-endian. The object table it points at is a run of `u32` offsets
/// (relative to the image begin), one per object start; that is all the
/// metadata needed to seed a liveness bitmap without parsing the object
/// graph.
#[derive(Copy, Clone, Debug)]
pub struct ImageHeader {
    magic: [u8; 8],
    version: u32,
    image_size: u32,
    object_count: u32,
    objects_offset: u32,
}

impl ImageHeader {
    /// Encoded size in the file.
    pub const SIZE: usize = 24;

    pub fn new(image_size: u32, object_count: u32, objects_offset: u32) -> ImageHeader {
        ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            image_size,
            object_count,
            objects_offset,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    pub fn object_count(&self) -> usize {
        self.object_count as usize
    }

    pub fn objects_offset(&self) -> usize {
        self.objects_offset as usize
    }

    /// Writer side of the format, for image builders.
    pub fn write_to(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.image_size.to_le_bytes())?;
        writer.write_all(&self.object_count.to_le_bytes())?;
        writer.write_all(&self.objects_offset.to_le_bytes())
    }

    /// Decode and validate the header at the start of a mapping.
    fn read_from(base: Address, mapped_len: usize) -> Result<ImageHeader, ImageError> {
        if mapped_len < Self::SIZE {
            return Err(ImageError::Truncated {
                expected: Self::SIZE,
                actual: mapped_len,
            });
        }
        let bytes = unsafe { core::slice::from_raw_parts(base.to_ptr::<u8>(), Self::SIZE) };
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        let word = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        if magic != IMAGE_MAGIC {
            return Err(ImageError::BadMagic(magic));
        }
        let version = word(8);
        if version != IMAGE_VERSION {
            return Err(ImageError::UnsupportedVersion {
                found: version,
                supported: IMAGE_VERSION,
            });
        }
        Ok(ImageHeader {
            magic,
            version,
            image_size: word(12),
            object_count: word(16),
            objects_offset: word(20),
        })
    }
}

/// Failure to load an image file. Kept distinct from allocation failures:
/// the embedder's recovery (run without the image) is a different decision
/// tree than collect-and-retry.
#[derive(Debug)]
pub enum ImageError {
    Io(io::Error),
    Truncated { expected: usize, actual: usize },
    BadMagic([u8; 8]),
    UnsupportedVersion { found: u32, supported: u32 },
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImageError::Io(err) => write!(f, "image i/o error: {}", err),
            ImageError::Truncated { expected, actual } => {
                write!(f, "truncated image: need {} bytes, have {}", expected, actual)
            }
            ImageError::BadMagic(magic) => write!(f, "bad image magic {:?}", magic),
            ImageError::UnsupportedVersion { found, supported } => {
                write!(f, "image version {} unsupported (expected {})", found, supported)
            }
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> ImageError {
        ImageError::Io(err)
    }
}

pub struct ImageSpace {
    // the image file path doubles as the space name
    name: String,
    mem_map: MemMap,
    begin: Address,
    end: Address,
    header: ImageHeader,
    live_bitmap: Arc<SpaceBitmap>,
}

impl std::fmt::Debug for ImageSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSpace")
            .field("name", &self.name)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .finish()
    }
}

impl ImageSpace {
    /// Memory-map `image_path` read-only and validate its header. The image
    /// records begin-relative offsets only, so wherever the OS places the
    /// mapping is fine; there is no fixed-base requirement.
    pub fn create(image_path: &Path) -> Result<ImageSpace, ImageError> {
        let file = File::open(image_path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < ImageHeader::SIZE {
            return Err(ImageError::Truncated {
                expected: ImageHeader::SIZE,
                actual: file_len,
            });
        }
        let name = image_path.display().to_string();
        let mem_map = MemMap::map_file(&name, &file, file_len, PROT_READ)?;
        let begin = mem_map.begin();
        let header = ImageHeader::read_from(begin, file_len)?;

        let image_size = header.image_size();
        if image_size < ImageHeader::SIZE || image_size > file_len {
            return Err(ImageError::Truncated {
                expected: image_size,
                actual: file_len,
            });
        }
        let table_end = header.objects_offset() + header.object_count() * 4;
        if table_end > image_size {
            return Err(ImageError::Truncated {
                expected: table_end,
                actual: image_size,
            });
        }

        let live_bitmap = SpaceBitmap::new(&format!("{} live-bitmap", name), begin, mem_map.size())
            .map_err(ImageError::Io)?;
        log::info!(
            "loaded image '{}' at {}: {} objects, {}",
            name,
            begin,
            header.object_count(),
            formatted_size(image_size)
        );
        Ok(ImageSpace {
            name,
            begin,
            end: begin.offset(image_size),
            header,
            live_bitmap: Arc::new(live_bitmap),
            mem_map,
        })
    }

    pub fn image_header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn image_filename(&self) -> &str {
        &self.name
    }

    /// Set a bit in `bitmap` for every object start recorded in the image's
    /// object table. Called once at load time to seed the collector's global
    /// liveness bookkeeping.
    pub fn record_image_allocations(&self, bitmap: &SpaceBitmap) {
        log::debug!(
            "recording {} image objects of '{}'",
            self.header.object_count(),
            self.name
        );
        let table = self.begin.offset(self.header.objects_offset());
        for i in 0..self.header.object_count() {
            let mut buf = [0u8; 4];
            unsafe {
                core::ptr::copy_nonoverlapping(
                    table.offset(i * 4).to_ptr::<u8>(),
                    buf.as_mut_ptr(),
                    4,
                );
            }
            let offset = u32::from_le_bytes(buf) as usize;
            debug_assert!(offset < self.header.image_size());
            debug_assert!(offset % OBJECT_ALIGNMENT == 0);
            bitmap.set(self.begin.offset(offset));
        }
    }
}

impl Space for ImageSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self) -> Address {
        self.begin
    }

    fn end(&self) -> Address {
        self.end
    }

    fn capacity(&self) -> usize {
        self.mem_map.size()
    }

    fn non_growth_limit_capacity(&self) -> usize {
        self.mem_map.size()
    }

    fn gc_retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::NeverCollect
    }

    fn set_gc_retention_policy(&self, policy: GcRetentionPolicy) {
        log::warn!(
            "ignoring retention policy {} for immutable image space '{}'",
            policy,
            self.name
        );
    }

    fn is_alloc_space(&self) -> bool {
        false
    }

    fn is_image_space(&self) -> bool {
        true
    }

    fn is_zygote_space(&self) -> bool {
        false
    }

    fn live_bitmap(&self) -> Arc<SpaceBitmap> {
        self.live_bitmap.clone()
    }

    /// Same instance as the live bitmap: image objects are immutable and
    /// always live, a separate mark bitmap would only add collector special
    /// cases.
    fn mark_bitmap(&self) -> Arc<SpaceBitmap> {
        self.live_bitmap.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    struct TempImage {
        path: PathBuf,
    }

    impl TempImage {
        /// Write a well-formed image: header, object data, then the object
        /// table at `objects_offset`.
        fn build(tag: &str, object_offsets: &[u32]) -> TempImage {
            let image_size = 4096u32;
            let objects_offset = 1024u32;
            let header = ImageHeader::new(image_size, object_offsets.len() as u32, objects_offset);

            let mut bytes = Vec::new();
            header.write_to(&mut bytes).unwrap();
            bytes.resize(objects_offset as usize, 0);
            for &offset in object_offsets {
                bytes.extend_from_slice(&offset.to_le_bytes());
            }
            bytes.resize(image_size as usize, 0);
            TempImage::write(tag, &bytes)
        }

        fn write(tag: &str, bytes: &[u8]) -> TempImage {
            let path = std::env::temp_dir().join(format!(
                "heap-spaces-{}-{}.img",
                tag,
                std::process::id()
            ));
            let mut file = File::create(&path).unwrap();
            file.write_all(bytes).unwrap();
            TempImage { path }
        }
    }

    impl Drop for TempImage {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn test_load_and_record_allocations() {
        let offsets = [64u32, 256, 512];
        let image = TempImage::build("record", &offsets);
        let space = ImageSpace::create(&image.path).unwrap();

        assert_eq!(space.image_header().object_count(), 3);
        assert_eq!(space.size(), 4096);
        assert!(space.contains(space.begin()));
        assert!(!space.contains(space.end()));

        let bitmap = SpaceBitmap::new("image test", space.begin(), space.capacity()).unwrap();
        space.record_image_allocations(&bitmap);

        let mut recorded = Vec::new();
        bitmap.visit_marked_range(space.begin(), space.end(), |a| recorded.push(a));
        let expected: Vec<Address> = offsets
            .iter()
            .map(|&o| space.begin().offset(o as usize))
            .collect();
        assert_eq!(recorded, expected);
    }

    #[test]
    fn test_mark_bitmap_aliases_live() {
        let image = TempImage::build("alias", &[64]);
        let space = ImageSpace::create(&image.path).unwrap();
        assert!(Arc::ptr_eq(&space.live_bitmap(), &space.mark_bitmap()));
        // still the same instance later in the space's life
        space.live_bitmap().set(space.begin().offset(64));
        assert!(space.mark_bitmap().test(space.begin().offset(64)));
    }

    #[test]
    fn test_capability_queries_and_policy() {
        let image = TempImage::build("policy", &[64]);
        let space = ImageSpace::create(&image.path).unwrap();
        assert!(space.is_image_space());
        assert!(!space.is_alloc_space());
        assert!(!space.is_zygote_space());
        assert_eq!(space.gc_retention_policy(), GcRetentionPolicy::NeverCollect);
        space.set_gc_retention_policy(GcRetentionPolicy::AlwaysCollect);
        assert_eq!(space.gc_retention_policy(), GcRetentionPolicy::NeverCollect);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ImageSpace::create(Path::new("/nonexistent/heap-spaces.img")).unwrap_err();
        assert!(matches!(err, ImageError::Io(_)));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Vec::new();
        ImageHeader::new(4096, 0, ImageHeader::SIZE as u32)
            .write_to(&mut bytes)
            .unwrap();
        bytes[0] = b'X';
        bytes.resize(4096, 0);
        let image = TempImage::write("badmagic", &bytes);
        let err = ImageSpace::create(&image.path).unwrap_err();
        assert!(matches!(err, ImageError::BadMagic(_)));
    }

    #[test]
    fn test_version_mismatch_is_hard_failure() {
        let mut bytes = Vec::new();
        ImageHeader::new(4096, 0, ImageHeader::SIZE as u32)
            .write_to(&mut bytes)
            .unwrap();
        bytes[8] = 0xff;
        bytes.resize(4096, 0);
        let image = TempImage::write("version", &bytes);
        let err = ImageSpace::create(&image.path).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_truncated_file() {
        let image = TempImage::write("short", &[0u8; 8]);
        let err = ImageSpace::create(&image.path).unwrap_err();
        assert!(matches!(err, ImageError::Truncated { .. }));
    }
}
