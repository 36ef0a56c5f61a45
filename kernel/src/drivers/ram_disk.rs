use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A block device kept entirely in kernel memory.
pub struct RamDisk {
    sects: Vec<[u8; BLOCK_SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sects: vec![[0; BLOCK_SECTOR_SIZE]; sectors],
        }
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let sect = self
            .sects
            .get(sector as usize)
            .ok_or(BlockError::SectorOutOfBounds)?;
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        buf.copy_from_slice(sect);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let sect = self
            .sects
            .get_mut(sector as usize)
            .ok_or(BlockError::SectorOutOfBounds)?;
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        sect.copy_from_slice(buf);
        Ok(())
    }
}
