//! PE/COFF executables. The raw data of `.text` (or the first code section) is
//! the target region; named blocks are sections.

use super::Image;
use crate::error::{
    BlockIsTarget, BlockNameTooLong, BlockTooLarge, InvalidImage, MalformedImage,
    MissingCodeSection, Result, SectionTableFull,
};
use goblin::pe::section_table::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_READ,
};
use goblin::pe::PE;
use log::debug;
use snafu::{ensure, OptionExt, ResultExt};
use std::convert::TryFrom;

const SIGNATURE_LEN: usize = 4;
const COFF_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;
const SECTION_NAME_LEN: usize = 8;
const TEXT_SECTION: &str = ".text";

// Offsets inside the COFF and optional headers, identical for PE32 and PE32+.
const NUMBER_OF_SECTIONS: usize = 2;
const SIZE_OF_IMAGE: usize = 56;

#[derive(Clone, PartialEq, Eq, Debug)]
struct Section {
    name: String,
    header: usize,
    raw_offset: usize,
    raw_size: usize,
    virtual_address: usize,
    virtual_size: usize,
}

impl Section {
    fn raw(&self) -> std::ops::Range<usize> {
        self.raw_offset..self.raw_offset + self.raw_size
    }

    fn virtual_end(&self) -> usize {
        self.virtual_address + self.virtual_size.max(self.raw_size)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PeImage {
    data: Vec<u8>,
    sections: Vec<Section>,
    target: usize,
    /// End of the last section header.
    table_end: usize,
    /// Section headers may not reach past this offset.
    header_limit: usize,
    coff_offset: usize,
    optional_offset: usize,
    file_alignment: usize,
    section_alignment: usize,
}

impl PeImage {
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    pub fn target_name(&self) -> &str {
        &self.sections[self.target].name
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, offset: usize, value: usize) -> Result<()> {
        let value = u32::try_from(value).ok().context(InvalidImage {
            reason: "value does not fit a 32-bit header field",
        })?;
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Rewrites the header fields of section `index` and the image size.
    fn sync_section(&mut self, index: usize) -> Result<()> {
        let section = self.sections[index].clone();
        self.write_u32(section.header + 8, section.virtual_size)?;
        self.write_u32(section.header + 12, section.virtual_address)?;
        self.write_u32(section.header + 16, section.raw_size)?;
        self.write_u32(section.header + 20, section.raw_offset)?;

        let size_of_image = self
            .sections
            .iter()
            .map(|s| align(s.virtual_end(), self.section_alignment))
            .max()
            .unwrap_or(0);
        self.write_u32(self.optional_offset + SIZE_OF_IMAGE, size_of_image)
    }

    fn rewrite(&mut self, index: usize, contents: &[u8]) -> Result<()> {
        let section = &mut self.sections[index];
        section.virtual_size = section.virtual_size.max(contents.len());
        let raw = section.raw();
        let region = &mut self.data[raw];
        region[..contents.len()].copy_from_slice(contents);
        for b in &mut region[contents.len()..] {
            *b = 0;
        }
        self.sync_section(index)
    }

    fn is_last(&self, index: usize) -> bool {
        let section = &self.sections[index];
        section.raw_offset + section.raw_size == self.data.len()
            && self
                .sections
                .iter()
                .all(|s| s.virtual_address <= section.virtual_address)
    }

    fn grow(&mut self, index: usize, contents: &[u8]) -> Result<()> {
        let raw_size = align(contents.len(), self.file_alignment);
        let section = &mut self.sections[index];
        section.raw_size = raw_size;
        section.virtual_size = contents.len();
        let raw_offset = section.raw_offset;

        self.data.truncate(raw_offset);
        self.data.extend_from_slice(contents);
        self.data.resize(raw_offset + raw_size, 0);
        debug!(
            "Grew section '{}' to {} bytes",
            self.sections[index].name, raw_size
        );
        self.sync_section(index)
    }

    fn append(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        let header = self.table_end;
        ensure!(
            header + SECTION_HEADER_LEN <= self.header_limit,
            SectionTableFull { name }
        );

        let raw_offset = align(self.data.len(), self.file_alignment);
        let raw_size = align(contents.len().max(1), self.file_alignment);
        let virtual_address = self
            .sections
            .iter()
            .map(|s| align(s.virtual_end(), self.section_alignment))
            .max()
            .unwrap_or(self.section_alignment);

        self.data.resize(raw_offset, 0);
        self.data.extend_from_slice(contents);
        self.data.resize(raw_offset + raw_size, 0);

        let mut raw_header = [0u8; SECTION_HEADER_LEN];
        raw_header[..name.len()].copy_from_slice(name.as_bytes());
        raw_header[36..].copy_from_slice(
            &(IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ).to_le_bytes(),
        );
        self.data[header..header + SECTION_HEADER_LEN].copy_from_slice(&raw_header);

        self.sections.push(Section {
            name: name.to_string(),
            header,
            raw_offset,
            raw_size,
            virtual_address,
            virtual_size: contents.len(),
        });
        self.table_end += SECTION_HEADER_LEN;

        let count = u16::try_from(self.sections.len()).ok().context(InvalidImage {
            reason: "too many sections",
        })?;
        self.write_u16(self.coff_offset + NUMBER_OF_SECTIONS, count);
        debug!(
            "Added section '{}' at 0x{:x} ({} bytes)",
            name, raw_offset, raw_size
        );
        self.sync_section(self.sections.len() - 1)
    }
}

impl Image for PeImage {
    fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let layout = Layout::read(&bytes)?;

        for section in &layout.sections {
            ensure!(
                section.raw_offset + section.raw_size <= bytes.len(),
                InvalidImage {
                    reason: format!("section '{}' runs past the end of the file", section.name),
                }
            );
        }

        let target = layout
            .sections
            .iter()
            .position(|s| s.name == TEXT_SECTION)
            .or_else(|| {
                layout
                    .characteristics
                    .iter()
                    .position(|&c| c & IMAGE_SCN_CNT_CODE != 0)
            })
            .context(MissingCodeSection)?;

        Ok(PeImage {
            data: bytes,
            sections: layout.sections,
            target,
            table_end: layout.table_end,
            header_limit: layout.header_limit,
            coff_offset: layout.coff_offset,
            optional_offset: layout.optional_offset,
            file_alignment: layout.file_alignment,
            section_alignment: layout.section_alignment,
        })
    }

    fn target(&self) -> &[u8] {
        &self.data[self.sections[self.target].raw()]
    }

    fn target_mut(&mut self) -> &mut [u8] {
        let raw = self.sections[self.target].raw();
        &mut self.data[raw]
    }

    fn block(&self, name: &str) -> Option<&[u8]> {
        self.find(name).map(|i| &self.data[self.sections[i].raw()])
    }

    fn store_block(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        ensure!(
            !name.is_empty() && name.len() <= SECTION_NAME_LEN,
            BlockNameTooLong { name }
        );

        match self.find(name) {
            Some(index) => {
                ensure!(index != self.target, BlockIsTarget { name });
                if contents.len() <= self.sections[index].raw_size {
                    self.rewrite(index, contents)
                } else if self.is_last(index) {
                    self.grow(index, contents)
                } else {
                    BlockTooLarge {
                        name,
                        len: contents.len(),
                        capacity: self.sections[index].raw_size,
                    }
                    .fail()
                }
            }
            None => self.append(name, contents),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.data.clone()
    }
}

/// Header values pulled out of the goblin parse.
struct Layout {
    sections: Vec<Section>,
    characteristics: Vec<u32>,
    table_end: usize,
    header_limit: usize,
    coff_offset: usize,
    optional_offset: usize,
    file_alignment: usize,
    section_alignment: usize,
}

impl Layout {
    fn read(bytes: &[u8]) -> Result<Self> {
        let pe = PE::parse(bytes).context(MalformedImage)?;
        let optional = pe.header.optional_header.as_ref().context(InvalidImage {
            reason: "missing optional header",
        })?;
        let windows = &optional.windows_fields;
        ensure!(
            windows.file_alignment > 0 && windows.section_alignment > 0,
            InvalidImage {
                reason: "zero section or file alignment",
            }
        );

        let coff_offset = pe.header.dos_header.pe_pointer as usize + SIGNATURE_LEN;
        let optional_offset = coff_offset + COFF_HEADER_LEN;
        let table = optional_offset + pe.header.coff_header.size_of_optional_header as usize;

        let sections: Vec<Section> = pe
            .sections
            .iter()
            .enumerate()
            .map(|(i, s)| Section {
                name: String::from_utf8_lossy(&s.name)
                    .trim_end_matches('\0')
                    .to_string(),
                header: table + i * SECTION_HEADER_LEN,
                raw_offset: s.pointer_to_raw_data as usize,
                raw_size: s.size_of_raw_data as usize,
                virtual_address: s.virtual_address as usize,
                virtual_size: s.virtual_size as usize,
            })
            .collect();
        let characteristics = pe.sections.iter().map(|s| s.characteristics).collect();

        let first_raw = sections
            .iter()
            .filter(|s| s.raw_size > 0)
            .map(|s| s.raw_offset)
            .min()
            .unwrap_or(usize::MAX);

        Ok(Layout {
            table_end: table + sections.len() * SECTION_HEADER_LEN,
            header_limit: first_raw.min(windows.size_of_headers as usize),
            sections,
            characteristics,
            coff_offset,
            optional_offset,
            file_alignment: windows.file_alignment as usize,
            section_alignment: windows.section_alignment as usize,
        })
    }
}

fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}
