use std::ops::Range;

use binary_layout::prelude::*;
use strum_macros::Display;
use thiserror::Error;

pub const DEFAULT_SECTION_NAME: &str = ".text";

const DOS_MAGIC: u16 = 0x5A4D; // MZ
const NT_MAGIC: u32 = 0x0000_4550; // PE\0\0
const SECTION_NAME_LEN: usize = 8;

binary_layout!(dos_header, LittleEndian, {
  e_magic: u16,
  stub: [u8; 58],
  e_lfanew: u32,
});

binary_layout!(nt_headers, LittleEndian, {
  signature: u32,
  machine: u16,
  number_of_sections: u16,
  time_date_stamp: u32,
  pointer_to_symbol_table: u32,
  number_of_symbols: u32,
  size_of_optional_header: u16,
  characteristics: u16,
});

binary_layout!(section_header, LittleEndian, {
  name: [u8; 8],
  virtual_size: u32,
  virtual_address: u32,
  size_of_raw_data: u32,
  pointer_to_raw_data: u32,
  pointer_to_relocations: u32,
  pointer_to_linenumbers: u32,
  number_of_relocations: u16,
  number_of_linenumbers: u16,
  characteristics: u32,
});

pub const DOS_HEADER_SIZE: usize = 64;
pub const NT_HEADERS_SIZE: usize = 24;
pub const SECTION_HEADER_SIZE: usize = 40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SectionError {
    #[error("file is too small to hold a DOS header ({0} bytes)")]
    TooSmall(usize),
    #[error("bad DOS magic: 0x{0:04X}")]
    BadDosMagic(u16),
    #[error("NT headers at 0x{0:X} run past the end of the file")]
    NtHeaderOutOfBounds(u32),
    #[error("bad NT magic: 0x{0:08X}")]
    BadNtMagic(u32),
    #[error("section table is truncated after {0} entries")]
    SectionTableTruncated(usize),
    #[error("no {0} section")]
    SectionMissing(String),
    #[error("section data at 0x{pointer:X} (+0x{size:X}) runs past the end of the file")]
    SectionOutOfBounds { pointer: u32, size: u32 },
}

/// How the bytes of a file should be interpreted.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A PE image whose code section has to be located.
    #[strum(serialize = "container")]
    Container,
    /// A code section that was already extracted to its own file.
    #[strum(serialize = "code section")]
    CodeSection,
}

/// The code section of a file buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSection<'a> {
    /// Offset of the section within the file.
    pub offset: usize,
    pub bytes: &'a [u8],
}

impl CodeSection<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn file_range(&self) -> Range<usize> {
        self.offset..self.offset + self.bytes.len()
    }
}

/// Returns `len` bytes at `offset`, or None if any of them is out of bounds.
fn field_bytes(buffer: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    buffer.get(offset..offset.checked_add(len)?)
}

/// Offset of the `idx`th section table entry, or None on overflow.
fn section_entry_offset(
    nt_offset: usize,
    optional_header_size: usize,
    idx: usize,
) -> Option<usize> {
    nt_offset
        .checked_add(NT_HEADERS_SIZE)?
        .checked_add(optional_header_size)?
        .checked_add(idx.checked_mul(SECTION_HEADER_SIZE)?)
}

/// Finds the code section of `buffer`.
///
/// Every error means the section could not be found. None of them are fatal
/// to a scan; truncated and garbage files are expected.
pub fn locate<'a>(
    buffer: &'a [u8],
    kind: FileKind,
    section_name: &str,
) -> Result<CodeSection<'a>, SectionError> {
    match kind {
        FileKind::CodeSection => Ok(CodeSection { offset: 0, bytes: buffer }),
        FileKind::Container => locate_in_pe(buffer, section_name),
    }
}

fn locate_in_pe<'a>(
    buffer: &'a [u8],
    section_name: &str,
) -> Result<CodeSection<'a>, SectionError> {
    let dos_bytes =
        field_bytes(buffer, 0, DOS_HEADER_SIZE).ok_or(SectionError::TooSmall(buffer.len()))?;
    let dos = dos_header::View::new(dos_bytes);
    let magic = dos.e_magic().read();
    if magic != DOS_MAGIC {
        return Err(SectionError::BadDosMagic(magic));
    }

    let e_lfanew = dos.e_lfanew().read();
    let nt_offset = e_lfanew as usize;
    let nt_bytes = field_bytes(buffer, nt_offset, NT_HEADERS_SIZE)
        .ok_or(SectionError::NtHeaderOutOfBounds(e_lfanew))?;
    let nt = nt_headers::View::new(nt_bytes);
    let signature = nt.signature().read();
    if signature != NT_MAGIC {
        return Err(SectionError::BadNtMagic(signature));
    }

    let num_sections = nt.number_of_sections().read() as usize;
    let optional_header_size = nt.size_of_optional_header().read() as usize;

    let wanted = section_name.as_bytes();
    let wanted = &wanted[..wanted.len().min(SECTION_NAME_LEN)];

    for idx in 0..num_sections {
        let entry_bytes = section_entry_offset(nt_offset, optional_header_size, idx)
            .and_then(|offset| field_bytes(buffer, offset, SECTION_HEADER_SIZE))
            .ok_or(SectionError::SectionTableTruncated(idx))?;
        let entry = section_header::View::new(entry_bytes);

        if &entry.name()[..wanted.len()] != wanted {
            continue;
        }

        let pointer = entry.pointer_to_raw_data().read();
        let size = entry.size_of_raw_data().read();
        let bytes = field_bytes(buffer, pointer as usize, size as usize)
            .ok_or(SectionError::SectionOutOfBounds { pointer, size })?;
        return Ok(CodeSection { offset: pointer as usize, bytes });
    }

    Err(SectionError::SectionMissing(section_name.to_string()))
}

/// Builds minimal PE images for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const OPTIONAL_HEADER_SIZE: u16 = 0xF0;
    pub const FILE_ALIGNMENT: usize = 0x200;

    /// Lays out one section per `(name, data)` pair after the headers.
    pub fn build_pe(sections: &[(&str, &[u8])]) -> Vec<u8> {
        let nt_offset = DOS_HEADER_SIZE;
        let table_offset = nt_offset + NT_HEADERS_SIZE + OPTIONAL_HEADER_SIZE as usize;
        let headers_end = table_offset + sections.len() * SECTION_HEADER_SIZE;
        let mut data_offset = headers_end.next_multiple_of(FILE_ALIGNMENT);

        let mut image = vec![0u8; data_offset];
        image[0..2].copy_from_slice(&DOS_MAGIC.to_le_bytes());
        image[0x3C..0x40].copy_from_slice(&(nt_offset as u32).to_le_bytes());

        let nt = &mut image[nt_offset..nt_offset + NT_HEADERS_SIZE];
        nt[0..4].copy_from_slice(&NT_MAGIC.to_le_bytes());
        nt[4..6].copy_from_slice(&0x8664u16.to_le_bytes());
        nt[6..8].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        nt[20..22].copy_from_slice(&OPTIONAL_HEADER_SIZE.to_le_bytes());

        for (idx, (name, data)) in sections.iter().enumerate() {
            let entry_offset = table_offset + idx * SECTION_HEADER_SIZE;
            let entry = &mut image[entry_offset..entry_offset + SECTION_HEADER_SIZE];
            let name = name.as_bytes();
            entry[..name.len()].copy_from_slice(name);
            entry[8..12].copy_from_slice(&(data.len() as u32).to_le_bytes());
            entry[16..20].copy_from_slice(&(data.len() as u32).to_le_bytes());
            entry[20..24].copy_from_slice(&(data_offset as u32).to_le_bytes());
            data_offset += data.len();
        }
        for (_, data) in sections {
            image.extend_from_slice(data);
        }
        image
    }

    /// A PE with a `.rdata` section followed by `.text` holding `code`.
    pub fn pe_with_code(code: &[u8]) -> Vec<u8> {
        build_pe(&[(".rdata", &[0xCC; 0x30][..]), (".text", code)])
    }

    pub fn table_offset() -> usize {
        DOS_HEADER_SIZE + NT_HEADERS_SIZE + OPTIONAL_HEADER_SIZE as usize
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn locate_text(buffer: &[u8]) -> Result<CodeSection<'_>, SectionError> {
        locate(buffer, FileKind::Container, DEFAULT_SECTION_NAME)
    }

    #[test]
    fn layout_sizes_match_the_pe_format() {
        assert_eq!(dos_header::SIZE, Some(DOS_HEADER_SIZE));
        assert_eq!(nt_headers::SIZE, Some(NT_HEADERS_SIZE));
        assert_eq!(section_header::SIZE, Some(SECTION_HEADER_SIZE));
    }

    #[test]
    fn finds_the_text_section() {
        let code = [0x48, 0x8B, 0x05, 0x11, 0x22, 0x33, 0x44];
        let image = pe_with_code(&code);
        let section = locate_text(&image).unwrap();
        assert_eq!(section.bytes, &code);
        assert_eq!(section.offset, FILE_ALIGNMENT + 0x30);
        assert_eq!(&image[section.file_range()], &code);
    }

    #[test]
    fn first_matching_section_wins() {
        let image = build_pe(&[(".text", &[1u8, 2][..]), (".text", &[3u8, 4][..])]);
        assert_eq!(locate_text(&image).unwrap().bytes, &[1, 2]);
    }

    #[test]
    fn other_section_names_can_be_located() {
        let image = pe_with_code(&[0x90]);
        let section = locate(&image, FileKind::Container, ".rdata").unwrap();
        assert_eq!(section.bytes, &[0xCC; 0x30]);
    }

    #[test]
    fn code_section_files_span_the_whole_buffer() {
        let buffer = [1u8, 2, 3];
        let section = locate(&buffer, FileKind::CodeSection, DEFAULT_SECTION_NAME).unwrap();
        assert_eq!(section.offset, 0);
        assert_eq!(section.bytes, &buffer);

        let section = locate(&[], FileKind::CodeSection, DEFAULT_SECTION_NAME).unwrap();
        assert!(section.is_empty());
    }

    #[test]
    fn empty_and_short_buffers_are_rejected() {
        assert_eq!(locate_text(&[]), Err(SectionError::TooSmall(0)));
        assert_eq!(locate_text(&[0x4D, 0x5A]), Err(SectionError::TooSmall(2)));
        assert_eq!(
            locate_text(&[0u8; DOS_HEADER_SIZE - 1]),
            Err(SectionError::TooSmall(DOS_HEADER_SIZE - 1))
        );
    }

    #[test]
    fn bad_dos_magic_is_rejected() {
        assert_eq!(
            locate_text(&[0u8; DOS_HEADER_SIZE]),
            Err(SectionError::BadDosMagic(0))
        );
    }

    #[test]
    fn out_of_range_nt_offset_is_rejected() {
        let mut image = pe_with_code(&[0x90]);
        image[0x3C..0x40].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(
            locate_text(&image),
            Err(SectionError::NtHeaderOutOfBounds(u32::MAX))
        );

        // DOS header only, pointing at itself plus a truncated NT header
        let mut image = pe_with_code(&[0x90]);
        image.truncate(DOS_HEADER_SIZE + NT_HEADERS_SIZE - 1);
        assert_eq!(
            locate_text(&image),
            Err(SectionError::NtHeaderOutOfBounds(DOS_HEADER_SIZE as u32))
        );
    }

    #[test]
    fn bad_nt_magic_is_rejected() {
        let mut image = pe_with_code(&[0x90]);
        image[DOS_HEADER_SIZE] = b'N';
        assert!(matches!(
            locate_text(&image),
            Err(SectionError::BadNtMagic(_))
        ));
    }

    #[test]
    fn truncated_section_table_is_rejected() {
        let mut image = pe_with_code(&[0x90]);
        // Cut inside the second (.text) entry
        image.truncate(table_offset() + SECTION_HEADER_SIZE + 10);
        assert_eq!(
            locate_text(&image),
            Err(SectionError::SectionTableTruncated(1))
        );
    }

    #[test]
    fn inflated_section_count_is_rejected() {
        let mut image = pe_with_code(&[0x90]);
        let count_offset = DOS_HEADER_SIZE + 6;
        image[count_offset..count_offset + 2].copy_from_slice(&u16::MAX.to_le_bytes());
        // .text is still found before the table runs out
        assert!(locate_text(&image).is_ok());
        assert!(matches!(
            locate(&image, FileKind::Container, ".data"),
            Err(SectionError::SectionTableTruncated(_))
        ));
    }

    #[test]
    fn section_entry_offsets_do_not_overflow() {
        assert_eq!(section_entry_offset(0x40, 0xF0, 0), Some(table_offset()));
        assert_eq!(
            section_entry_offset(0x40, 0xF0, 2),
            Some(table_offset() + 2 * SECTION_HEADER_SIZE)
        );
        assert_eq!(section_entry_offset(usize::MAX - 10, 0, 0), None);
        assert_eq!(section_entry_offset(0, usize::MAX - 30, 0), None);
        assert_eq!(section_entry_offset(0, 0, usize::MAX / 2), None);
    }

    #[test]
    fn missing_section_is_reported() {
        let image = build_pe(&[(".data", &[0u8; 4][..])]);
        assert_eq!(
            locate_text(&image),
            Err(SectionError::SectionMissing(".text".into()))
        );
    }

    #[test]
    fn section_data_past_the_end_is_rejected() {
        let mut image = pe_with_code(&[0x90, 0x90]);
        image.pop();
        assert!(matches!(
            locate_text(&image),
            Err(SectionError::SectionOutOfBounds { size: 2, .. })
        ));

        let mut image = pe_with_code(&[0x90]);
        let entry = table_offset() + SECTION_HEADER_SIZE;
        image[entry + 16..entry + 24].copy_from_slice(&[0xFF; 8]);
        assert_eq!(
            locate_text(&image),
            Err(SectionError::SectionOutOfBounds { pointer: u32::MAX, size: u32::MAX })
        );
    }

    #[test]
    fn garbage_never_panics() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let valid = pe_with_code(&[0x55, 0x48, 0x89, 0xE5]);
        for _ in 0..2000 {
            let mut image = valid.clone();
            let len = rng.random_range(0..=image.len());
            image.truncate(len);
            for _ in 0..rng.random_range(0..8) {
                if image.is_empty() {
                    break;
                }
                let idx = rng.random_range(0..table_offset().min(image.len()));
                image[idx] = rng.random();
            }
            if let Ok(section) = locate_text(&image) {
                assert!(section.file_range().end <= image.len());
            }
        }
    }
}
