//! The translation engine: write remapping, garbage collection, wear
//! leveling, and crash-consistent metadata persistence.

use std::collections::{BTreeMap, VecDeque};
use std::mem;

use anyhow::{ensure, Context, Result};
use thiserror::Error;

use super::codec::{
    self, FtlInfo, MetaReader, MetaWriteCursor, EPOCH_MASK, META_CRC, META_HEADER_BYTES,
    META_PAYLOAD_BYTES, META_TRAILER_BYTES,
};
use super::geometry::{Geometry, GC_RESERVE_EBS, LBAS_PER_EB, LBA_BYTES, MAX_PE_DIFF};
use super::tables::{EbStateTable, L2pEntry, PeTable, EB_STATE_META};
use crate::flash::{Flash, EB_BYTES};

/// Errors callers are expected to match on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FtlError {
    #[error("lba {lba} is out of range (device exposes {count} logical blocks)")]
    LbaOutOfRange { lba: u32, count: u32 },
}

/// How [`Ftl::start`] brought the device up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    /// A consistent metadata snapshot was found and replayed.
    Restored,
    /// No usable snapshot existed; the device was formatted fresh.
    Formatted,
}

/// Epochs 0 and 1 describe a blank device; the first commit a fresh instance
/// makes is therefore always newer than anything it could find on flash.
const FIRST_EPOCH: u32 = 2;

/// Blocks whose garbage-collection score exceeds this carry overdue
/// wear-leveling debt, and the write path keeps collecting until none do.
const GC_SCORE_URGENT: u32 = 10;

/// A flash translation layer instance owning one device.
///
/// Single-threaded and non-reentrant: the instance assumes exclusive access
/// from the moment [`start`](Self::start) returns. Callers serving
/// concurrent requests must serialize them around the instance.
pub struct Ftl<F: Flash> {
    flash: F,
    geo: Geometry,
    l2p: Vec<L2pEntry>,
    states: EbStateTable,
    pe: PeTable,
    /// One slot per metadata erase block; `None` while a slot is unassigned.
    meta_slots: Vec<Option<u32>>,
    empty_ebs: usize,
    valid_lbas: usize,
    /// Wraps every 256 mutations, forcing a commit and an age-out sweep.
    meta_age: u8,
    epoch: u32,
    open_eb: Option<u32>,
    open_next_idx: u32,
    /// Rotating garbage-collection cursor; persists across rounds so every
    /// block gets visited even when scores never force the issue.
    gc_cursor: u32,
}

impl<F: Flash> Ftl<F> {
    /// Wrap a flash device. Call [`start`](Self::start) before anything else.
    pub fn new(flash: F) -> Result<Self> {
        let geo = Geometry::for_flash(&flash)?;
        Ok(Self {
            l2p: vec![L2pEntry::INVALID; geo.flash_lbas],
            states: EbStateTable::new(geo.erase_blocks),
            pe: PeTable::new(geo.erase_blocks),
            meta_slots: vec![None; geo.meta_ebs],
            empty_ebs: geo.erase_blocks,
            valid_lbas: 0,
            meta_age: 0,
            epoch: FIRST_EPOCH,
            open_eb: None,
            open_next_idx: 0,
            gc_cursor: 0,
            flash,
            geo,
        })
    }

    /// Bring the device up: replay the newest consistent metadata snapshot,
    /// or format if none survives scrutiny.
    pub fn start(&mut self) -> Result<Started> {
        let mut by_epoch = self.populate_metadata_map();
        while let Some((epoch, blocks)) = by_epoch.pop_last() {
            if self.try_restore_epoch(epoch, &blocks)? {
                self.meta_age = 0;
                return Ok(Started::Restored);
            }
        }
        self.format()?;
        Ok(Started::Formatted)
    }

    /// Reset to an empty device: zero every table, reserve the first blocks
    /// for metadata, and purge anything on flash that still looks like a
    /// metadata snapshot.
    pub fn format(&mut self) -> Result<()> {
        self.l2p.fill(L2pEntry::INVALID);
        self.pe.clear();
        self.states.clear();
        self.valid_lbas = 0;
        self.empty_ebs = self.geo.erase_blocks;
        for slot in 0..self.geo.meta_ebs {
            self.empty_ebs -= 1;
            self.states.set_meta(slot as u32);
            self.meta_slots[slot] = Some(slot as u32);
        }
        self.meta_age = 0;
        self.open_eb = None;
        self.open_next_idx = 0;

        for eb in 0..self.geo.erase_blocks as u32 {
            let stale = self.flash.read_eb(eb).starts_with(&codec::META_SIG);
            if stale {
                self.flash.erase_block(eb)?;
            }
        }
        Ok(())
    }

    /// Commit the current state to flash under the next epoch.
    pub fn persist(&mut self) -> Result<()> {
        self.do_persist()
    }

    /// Write one logical block. May trigger garbage collection, wear
    /// leveling, and a metadata commit before returning.
    pub fn write(&mut self, lba: u32, data: &[u8; LBA_BYTES]) -> Result<()> {
        self.check_lba(lba)?;
        let eb = match self.open_eb {
            Some(eb) => eb,
            None => {
                let eb = self.select_best_eb()?;
                self.open_eb = Some(eb);
                eb
            }
        };
        let idx = self.open_next_idx;
        self.flash.program(eb, idx as usize * LBA_BYTES, data)?;

        let old = self.l2p[lba as usize];
        if old.is_valid() {
            self.states.dec_valid(old.eb());
            if self.states.get(old.eb()) == 0 && old.eb() != eb {
                self.empty_ebs += 1;
            }
        } else {
            self.valid_lbas += 1;
        }
        self.states.inc_valid(eb);
        self.l2p[lba as usize] = L2pEntry::map(eb, idx);

        self.open_next_idx += 1;
        if self.open_next_idx as usize >= LBAS_PER_EB {
            self.open_eb = None;
            self.open_next_idx = 0;
        }
        self.age_metadata()
    }

    /// Read one logical block. An LBA that was never written (or was
    /// trimmed) reads back as zeros.
    pub fn read(&self, lba: u32, out: &mut [u8; LBA_BYTES]) -> Result<()> {
        self.check_lba(lba)?;
        let entry = self.l2p[lba as usize];
        if entry.is_valid() {
            self.flash
                .read(entry.eb(), entry.idx() as usize * LBA_BYTES, out)?;
        } else {
            out.fill(0);
        }
        Ok(())
    }

    /// Discard one logical block. Idempotent.
    pub fn trim(&mut self, lba: u32) -> Result<()> {
        self.check_lba(lba)?;
        let entry = self.l2p[lba as usize];
        if !entry.is_valid() {
            return Ok(());
        }
        self.states.dec_valid(entry.eb());
        self.valid_lbas -= 1;
        if self.states.get(entry.eb()) == 0 && self.open_eb != Some(entry.eb()) {
            self.empty_ebs += 1;
        }
        self.l2p[lba as usize] = L2pEntry::INVALID;
        self.age_metadata()
    }

    /// Number of logical blocks this device exposes.
    pub fn lba_count(&self) -> u32 {
        self.geo.flash_lbas as u32
    }

    /// Number of erase blocks on the device.
    pub fn eb_count(&self) -> u32 {
        self.geo.erase_blocks as u32
    }

    /// Relative program/erase count of one block; add
    /// [`pe_count_offset`](Self::pe_count_offset) for the absolute count.
    pub fn pe_count(&self, eb: u32) -> u8 {
        self.pe.count(eb)
    }

    pub fn pe_count_offset(&self) -> u32 {
        self.pe.offset()
    }

    pub fn empty_eb_count(&self) -> usize {
        self.empty_ebs
    }

    pub fn valid_lba_count(&self) -> usize {
        self.valid_lbas
    }

    /// The erase blocks currently assigned to metadata slots.
    pub fn metadata_blocks(&self) -> Vec<u32> {
        self.meta_slots.iter().flatten().copied().collect()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Give the device back, e.g. to snapshot a simulator's image.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Re-derive every maintained aggregate from scratch and compare.
    /// Returns false on any mismatch; mutates nothing. A false return means
    /// a programming error somewhere in the engine.
    pub fn check(&self) -> bool {
        let mut empties = 0usize;
        let mut metas = 0usize;
        let mut max = 0u8;
        let mut min = u8::MAX;
        for eb in 0..self.geo.erase_blocks as u32 {
            let state = self.states.get(eb);
            // An open block is reserved for the writer, not free, even if
            // trims have drained it back to zero valid LBAs.
            if state == 0 && self.open_eb != Some(eb) {
                empties += 1;
            }
            if state == EB_STATE_META {
                metas += 1;
            }
            max = max.max(self.pe.count(eb));
            min = min.min(self.pe.count(eb));
        }

        let mut ok = true;
        ok &= metas <= self.geo.meta_ebs;
        ok &= empties == self.empty_ebs;
        ok &= max == self.pe.highest();
        ok &= u32::from(max - min) <= MAX_PE_DIFF + 1;

        let mut occupied = vec![0u8; self.geo.erase_blocks];
        let mut valid = 0usize;
        for entry in &self.l2p {
            if !entry.is_valid() {
                continue;
            }
            valid += 1;
            ok &= !self.states.is_meta(entry.eb());
            let cell = &mut occupied[entry.eb() as usize];
            ok &= *cell & (1 << entry.idx()) == 0;
            *cell |= 1 << entry.idx();
        }
        ok &= valid == self.valid_lbas;
        ok
    }

    fn check_lba(&self, lba: u32) -> Result<()> {
        let count = self.geo.flash_lbas as u32;
        if lba >= count {
            return Err(FtlError::LbaOutOfRange { lba, count }.into());
        }
        Ok(())
    }

    // ---- erase-block selection, garbage collection, wear leveling

    /// The free block with the lowest PE count; later blocks win ties. The
    /// open block is reserved and never offered.
    fn lowest_empty_eb(&self) -> Option<u32> {
        let mut best: Option<(u8, u32)> = None;
        for eb in 0..self.geo.erase_blocks as u32 {
            if self.states.get(eb) != 0 || self.open_eb == Some(eb) {
                continue;
            }
            match best {
                Some((pe, _)) if self.pe.count(eb) > pe => {}
                _ => best = Some((self.pe.count(eb), eb)),
            }
        }
        best.map(|(_, eb)| eb)
    }

    fn erase_eb(&mut self, eb: u32) -> Result<()> {
        self.flash.erase_block(eb)?;
        self.pe.record_erase(eb);
        self.states.set(eb, 0);
        Ok(())
    }

    /// Rank a block as a garbage-collection source. Free and metadata
    /// blocks are never collected; blocks lagging the wear front score
    /// highest, then sparsely-valid blocks.
    fn gc_score(&self, eb: u32) -> u32 {
        let state = self.states.get(eb);
        if state == EB_STATE_META || state == 0 {
            return 0;
        }
        let delta = self.pe.age(eb);
        if delta >= MAX_PE_DIFF {
            return GC_SCORE_URGENT + (delta - MAX_PE_DIFF); // aged out, oldest first
        }
        if delta > 7 * MAX_PE_DIFF / 8 {
            return 9; // getting old, move before it ages out
        }
        8 - u32::from(state)
    }

    /// One collection round: erase the youngest free block and refill it
    /// with valid LBAs from the highest-scoring sources. Returns the score
    /// of the last source chosen, which the caller uses to decide whether
    /// wear-leveling debt remains.
    fn garbage_collect(&mut self) -> Result<u32> {
        debug_assert!(self.open_eb.is_none());
        let blocks = self.geo.erase_blocks as u32;
        let dest = self
            .lowest_empty_eb()
            .context("garbage collection has no free destination block")?;
        self.erase_eb(dest)?;
        self.empty_ebs -= 1;

        let mut score = 0;
        // At least one LBA moves per pass, so eight passes always fill the
        // destination unless the device runs out of collectable blocks first.
        for _ in 0..LBAS_PER_EB {
            if usize::from(self.states.get(dest)) >= LBAS_PER_EB {
                break;
            }
            while self.states.is_meta(self.gc_cursor) || self.gc_cursor == dest {
                self.gc_cursor = (self.gc_cursor + 1) % blocks;
            }
            score = self.gc_score(self.gc_cursor);
            for step in 1..blocks {
                if score >= 8 {
                    break;
                }
                let candidate = (self.gc_cursor + step) % blocks;
                if candidate != dest && self.gc_score(candidate) > score {
                    self.gc_cursor = candidate;
                    score = self.gc_score(candidate);
                }
            }
            ensure!(score > 0, "garbage collection found no collectable block");
            self.collect_valid_lbas(self.gc_cursor, dest)?;
        }
        Ok(score)
    }

    /// Move every valid LBA of `src` into the next free slots of `dest`,
    /// in logical order, until `dest` is full. There is no reverse map, so
    /// this walks the whole L2P table per source block.
    fn collect_valid_lbas(&mut self, src: u32, dest: u32) -> Result<()> {
        let granule = self.geo.write_buffer;
        let mut chunk = [0u8; LBA_BYTES];
        let mut slot = u32::from(self.states.get(dest));
        for lba in 0..self.geo.flash_lbas {
            if slot as usize >= LBAS_PER_EB {
                break;
            }
            let entry = self.l2p[lba];
            if !entry.is_valid() || entry.eb() != src {
                continue;
            }
            for offset in (0..LBA_BYTES).step_by(granule) {
                self.flash
                    .read(src, entry.idx() as usize * LBA_BYTES + offset, &mut chunk[..granule])?;
                self.flash
                    .program(dest, slot as usize * LBA_BYTES + offset, &chunk[..granule])?;
            }
            self.states.dec_valid(src);
            if self.states.get(src) == 0 {
                self.empty_ebs += 1;
            }
            self.l2p[lba] = L2pEntry::map(dest, slot);
            self.states.inc_valid(dest);
            slot += 1;
        }
        Ok(())
    }

    /// The write path's sole source of destination blocks. Collects until
    /// the free pool has headroom and no block carries urgent wear-leveling
    /// debt, then hands over the youngest free block, already erased.
    fn select_best_eb(&mut self) -> Result<u32> {
        let mut score = 0;
        while self.empty_ebs < GC_RESERVE_EBS || score > GC_SCORE_URGENT {
            score = self.garbage_collect()?;
            self.meta_age_rewrite()?;
        }
        self.empty_ebs -= 1;
        let eb = self
            .lowest_empty_eb()
            .context("no free erase block after garbage collection")?;
        self.erase_eb(eb)?;
        Ok(eb)
    }

    /// Relocate any metadata block that has lagged the wear front by
    /// [`MAX_PE_DIFF`] erases: copy it verbatim (its CRC stays valid) onto
    /// the youngest free block and swap the slot over.
    fn meta_age_rewrite(&mut self) -> Result<()> {
        let granule = self.geo.write_buffer;
        for slot in 0..self.meta_slots.len() {
            let Some(eb) = self.meta_slots[slot] else {
                continue;
            };
            if self.pe.age(eb) < MAX_PE_DIFF {
                continue;
            }
            let dest = self
                .lowest_empty_eb()
                .context("no free erase block for metadata relocation")?;
            debug_assert_ne!(dest, eb);
            self.erase_eb(dest)?;
            let mut chunk = [0u8; LBA_BYTES];
            for offset in (0..EB_BYTES).step_by(granule) {
                self.flash.read(eb, offset, &mut chunk[..granule])?;
                self.flash.program(dest, offset, &chunk[..granule])?;
            }
            // The block freed here offsets the one consumed; empty_ebs nets
            // out to zero.
            self.states.set(eb, 0);
            self.states.set_meta(dest);
            self.meta_slots[slot] = Some(dest);
        }
        Ok(())
    }

    /// Bump the mutation counter; every 256th mutation commits the state
    /// and sweeps for aged-out metadata blocks.
    fn age_metadata(&mut self) -> Result<()> {
        self.meta_age = self.meta_age.wrapping_add(1);
        if self.meta_age == 0 {
            self.do_persist()?;
            self.meta_age_rewrite()?;
        }
        Ok(())
    }

    // ---- metadata persistence and recovery

    /// Commit the translation state under `epoch + 1`.
    ///
    /// The previous commit's blocks are left untouched until the commit
    /// after this one frees them, so a crash at any point here still leaves
    /// one older consistent snapshot discoverable.
    fn do_persist(&mut self) -> Result<()> {
        // Step 1: revalidate every slot; free the torn and the stale. Only
        // CRC-valid stale blocks are erased, so startup never has to wade
        // through a backlog of old epochs.
        for slot in 0..self.meta_slots.len() {
            let Some(eb) = self.meta_slots[slot] else {
                continue;
            };
            let frame = codec::parse_frame(self.flash.read_eb(eb));
            match frame {
                Some((epoch, _)) if epoch >= self.epoch => {}
                other => {
                    if other.is_some() {
                        self.flash.erase_block(eb)?;
                    }
                    self.states.set(eb, 0);
                    self.meta_slots[slot] = None;
                    self.empty_ebs += 1;
                }
            }
        }

        // Step 2: refill the freed slots from the youngest free blocks.
        let mut targets = VecDeque::new();
        for slot in 0..self.meta_slots.len() {
            if self.meta_slots[slot].is_some() {
                continue;
            }
            let eb = self
                .lowest_empty_eb()
                .context("no free erase block for metadata commit")?;
            self.states.set_meta(eb);
            self.meta_slots[slot] = Some(eb);
            self.empty_ebs -= 1;
            targets.push_back(eb);
        }

        // Steps 3 and 4: advance the epoch and stream the snapshot out.
        self.epoch = (self.epoch + 1) & EPOCH_MASK;
        let mut cursor = MetaWriteCursor::new(targets);

        let info = FtlInfo::for_geometry(&self.geo);
        let mut record = [0u8; FtlInfo::ENCODED_LEN];
        info.encode(&mut record[..]);
        for byte in record {
            self.meta_put_u8(&mut cursor, byte)?;
        }
        for i in 0..self.geo.erase_blocks {
            let byte = self.pe.as_bytes()[i];
            self.meta_put_u8(&mut cursor, byte)?;
        }
        for i in 0..self.states.byte_len() {
            let byte = self.states.as_bytes()[i];
            self.meta_put_u8(&mut cursor, byte)?;
        }
        for i in 0..self.geo.flash_lbas {
            let bits = self.l2p[i].to_bits();
            self.meta_put_u16(&mut cursor, bits)?;
        }
        let offset = self.pe.offset();
        self.meta_put_u32(&mut cursor, offset)?;
        self.meta_finish(&mut cursor)
    }

    /// Feed one byte into the outgoing snapshot stream. Lazily seals the
    /// current block with its CRC when full, and erases the next block the
    /// moment its first chunk is ready to program.
    fn meta_put_u8(&mut self, cursor: &mut MetaWriteCursor, byte: u8) -> Result<()> {
        if cursor.offset == EB_BYTES - META_TRAILER_BYTES {
            self.meta_seal_block(cursor)?;
        }
        if cursor.offset == 0 {
            self.meta_begin_block(cursor);
        }
        let granule = self.geo.write_buffer;
        cursor.chunk[cursor.offset % granule] = byte;
        cursor.digest.update(&[byte]);
        cursor.offset += 1;
        if cursor.offset % granule == 0 {
            let eb = *cursor
                .targets
                .front()
                .context("metadata stream overran its blocks")?;
            if cursor.offset == granule {
                self.erase_eb(eb)?;
                self.states.set_meta(eb);
            }
            self.flash.program(eb, cursor.offset - granule, &cursor.chunk[..granule])?;
            cursor.chunk[..granule].fill(0);
        }
        Ok(())
    }

    fn meta_put_u16(&mut self, cursor: &mut MetaWriteCursor, word: u16) -> Result<()> {
        self.meta_put_u8(cursor, (word >> 8) as u8)?;
        self.meta_put_u8(cursor, word as u8)
    }

    fn meta_put_u32(&mut self, cursor: &mut MetaWriteCursor, word: u32) -> Result<()> {
        for shift in [24, 16, 8, 0] {
            self.meta_put_u8(cursor, (word >> shift) as u8)?;
        }
        Ok(())
    }

    fn meta_begin_block(&mut self, cursor: &mut MetaWriteCursor) {
        cursor.chunk.fill(0);
        let header = codec::frame_header(self.epoch, cursor.index);
        cursor.chunk[..META_HEADER_BYTES].copy_from_slice(&header);
        cursor.digest.update(&header);
        cursor.offset = META_HEADER_BYTES;
    }

    fn meta_seal_block(&mut self, cursor: &mut MetaWriteCursor) -> Result<()> {
        let granule = self.geo.write_buffer;
        let digest = mem::replace(&mut cursor.digest, META_CRC.digest());
        let crc = digest.finalize();
        cursor.chunk[granule - META_TRAILER_BYTES..granule].copy_from_slice(&crc.to_le_bytes());
        let eb = *cursor
            .targets
            .front()
            .context("metadata stream overran its blocks")?;
        self.flash.program(eb, EB_BYTES - granule, &cursor.chunk[..granule])?;
        cursor.targets.pop_front();
        cursor.offset = 0;
        cursor.index += 1;
        Ok(())
    }

    /// Zero-fill until the final payload-bearing block is sealed. The fill
    /// stops as soon as the stream rolls into a fresh block, so trailing
    /// allocated slots are never touched on flash; the next commit's
    /// validation pass reclaims them.
    fn meta_finish(&mut self, cursor: &mut MetaWriteCursor) -> Result<()> {
        while cursor.offset > META_HEADER_BYTES + 1 {
            self.meta_put_u8(cursor, 0)?;
        }
        Ok(())
    }

    /// Scan the whole device for CRC-valid metadata blocks, bucketed by
    /// epoch.
    fn populate_metadata_map(&self) -> BTreeMap<u32, Vec<u32>> {
        let mut by_epoch: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for eb in 0..self.geo.erase_blocks as u32 {
            if let Some((epoch, _)) = codec::parse_frame(self.flash.read_eb(eb)) {
                by_epoch.entry(epoch).or_default().push(eb);
            }
        }
        by_epoch
    }

    /// Assemble and replay one epoch's snapshot. `Ok(false)` means the
    /// epoch is unusable (incomplete, or written by a different geometry)
    /// and the caller should fall back to the next-older one.
    fn try_restore_epoch(&mut self, epoch: u32, blocks: &[u32]) -> Result<bool> {
        // Order the stream by intra-epoch index. A wear-leveling relocation
        // can leave a not-yet-erased duplicate of an index; first wins, the
        // contents are identical.
        let mut by_index: Vec<Option<u32>> = vec![None; usize::from(u8::MAX) + 1];
        for &eb in blocks {
            if let Some((_, index)) = codec::parse_frame(self.flash.read_eb(eb)) {
                let slot = &mut by_index[usize::from(index)];
                if slot.is_none() {
                    *slot = Some(eb);
                }
            }
        }
        let ordered: VecDeque<u32> = by_index.into_iter().take_while(Option::is_some).flatten().collect();

        // The exact serialized size: info record, PE counts, state nibbles,
        // L2P entries, PE offset word.
        let needed = FtlInfo::ENCODED_LEN
            + self.geo.erase_blocks
            + self.states.byte_len()
            + 2 * self.geo.flash_lbas
            + 4;
        if ordered.len() * META_PAYLOAD_BYTES < needed {
            return Ok(false);
        }

        let mut reader = MetaReader::new(&self.flash, ordered);
        let mut record = [0u8; FtlInfo::ENCODED_LEN];
        reader.get_exact(&mut record)?;
        if FtlInfo::decode(&record[..]) != FtlInfo::for_geometry(&self.geo) {
            return Ok(false);
        }

        self.pe.clear();
        for eb in 0..self.geo.erase_blocks as u32 {
            let count = reader.get_u8()?;
            self.pe.load_count(eb, count);
        }

        for i in 0..self.states.byte_len() {
            let byte = reader.get_u8()?;
            self.states.set_byte(i, byte);
        }
        for slot in self.meta_slots.iter_mut() {
            *slot = None;
        }
        let mut next_slot = 0;
        self.empty_ebs = 0;
        for eb in 0..self.geo.erase_blocks as u32 {
            if self.states.is_meta(eb) {
                if next_slot >= self.meta_slots.len() {
                    return Ok(false);
                }
                self.meta_slots[next_slot] = Some(eb);
                next_slot += 1;
            } else if self.states.get(eb) == 0 {
                self.empty_ebs += 1;
            }
        }

        self.valid_lbas = 0;
        for i in 0..self.geo.flash_lbas {
            let entry = L2pEntry::from_bits(reader.get_u16()?);
            if entry.is_valid() {
                self.valid_lbas += 1;
            }
            self.l2p[i] = entry;
        }

        let offset = reader.get_u32()?;
        self.pe.set_offset(offset);
        self.epoch = epoch;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimFlash;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn ftl_on_blank(bytes: usize) -> Ftl<SimFlash> {
        let mut ftl = Ftl::new(SimFlash::new(bytes)).unwrap();
        assert_eq!(ftl.start().unwrap(), Started::Formatted);
        assert!(ftl.check());
        ftl
    }

    fn payload(lba: u32, gen: u64) -> [u8; LBA_BYTES] {
        let mut buf = [0u8; LBA_BYTES];
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = u64::from(lba)
                .wrapping_mul(31)
                .wrapping_add(gen.wrapping_mul(17))
                .wrapping_add(i as u64) as u8;
        }
        buf
    }

    #[test]
    fn fresh_format_geometry() {
        let ftl = ftl_on_blank(1024 * 1024);
        assert_eq!(ftl.lba_count(), 1992);
        assert_eq!(ftl.eb_count(), 256);
        assert_eq!(ftl.valid_lba_count(), 0);

        // Every LBA of a fresh device reads as zeros.
        let mut out = [0xAAu8; LBA_BYTES];
        ftl.read(0, &mut out).unwrap();
        assert_eq!(out, [0u8; LBA_BYTES]);
        out = [0xAAu8; LBA_BYTES];
        ftl.read(1991, &mut out).unwrap();
        assert_eq!(out, [0u8; LBA_BYTES]);
    }

    #[test]
    fn write_read_round_trip() {
        let mut ftl = ftl_on_blank(256 * 1024);
        let mut buf = [0u8; LBA_BYTES];
        buf[..6].copy_from_slice(b"lba 0\0");

        ftl.write(0, &buf).unwrap();
        let mut out = [0u8; LBA_BYTES];
        ftl.read(0, &mut out).unwrap();
        assert_eq!(out, buf);
        assert!(ftl.check());
    }

    #[test]
    fn overwrite_supersedes() {
        let mut ftl = ftl_on_blank(256 * 1024);
        ftl.write(5, &payload(5, 1)).unwrap();
        ftl.write(5, &payload(5, 2)).unwrap();

        let mut out = [0u8; LBA_BYTES];
        ftl.read(5, &mut out).unwrap();
        assert_eq!(out, payload(5, 2));
        assert_eq!(ftl.valid_lba_count(), 1);
        assert!(ftl.check());
    }

    #[test]
    fn trim_reclaims_the_block() {
        let mut ftl = ftl_on_blank(256 * 1024);
        let empty_at_start = ftl.empty_eb_count();

        // Exactly one erase block's worth of LBAs.
        for lba in 0..LBAS_PER_EB as u32 {
            ftl.write(lba, &payload(lba, 1)).unwrap();
        }
        assert_eq!(ftl.empty_eb_count(), empty_at_start - 1);
        let erases_after_fill: u32 = (0..ftl.eb_count()).map(|eb| u32::from(ftl.pe_count(eb))).sum();

        for lba in 0..LBAS_PER_EB as u32 {
            ftl.trim(lba).unwrap();
        }
        // The block's state drained back to free without an erase.
        assert_eq!(ftl.empty_eb_count(), empty_at_start);
        let erases_after_trim: u32 = (0..ftl.eb_count()).map(|eb| u32::from(ftl.pe_count(eb))).sum();
        assert_eq!(erases_after_trim, erases_after_fill);
        assert_eq!(ftl.valid_lba_count(), 0);
        assert!(ftl.check());

        let mut out = [0xAAu8; LBA_BYTES];
        ftl.read(3, &mut out).unwrap();
        assert_eq!(out, [0u8; LBA_BYTES]);
    }

    #[test]
    fn trim_is_idempotent() {
        let mut ftl = ftl_on_blank(256 * 1024);
        ftl.write(7, &payload(7, 1)).unwrap();
        ftl.trim(7).unwrap();
        let empties = ftl.empty_eb_count();
        ftl.trim(7).unwrap();
        assert_eq!(ftl.empty_eb_count(), empties);
        assert_eq!(ftl.valid_lba_count(), 0);
        assert!(ftl.check());
    }

    #[test]
    fn out_of_range_ops_fail_cleanly() {
        let mut ftl = ftl_on_blank(256 * 1024);
        ftl.write(1, &payload(1, 1)).unwrap();
        let valid = ftl.valid_lba_count();
        let count = ftl.lba_count();

        let err = ftl.write(count, &payload(0, 0)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<FtlError>(),
            Some(&FtlError::LbaOutOfRange { lba: count, count })
        );
        assert!(ftl.read(count, &mut [0u8; LBA_BYTES]).is_err());
        assert!(ftl.trim(count).is_err());

        assert_eq!(ftl.valid_lba_count(), valid);
        assert!(ftl.check());
    }

    #[test]
    fn persist_restore_round_trip() {
        let mut ftl = ftl_on_blank(1024 * 1024);
        let lbas = ftl.lba_count();
        let mut expected: Vec<Option<u64>> = vec![None; lbas as usize];

        let mut rng = StdRng::seed_from_u64(7);
        for op in 0..1000u64 {
            let lba = rng.gen_range(0..lbas);
            if op % 7 == 0 {
                ftl.trim(lba).unwrap();
                expected[lba as usize] = None;
            } else {
                ftl.write(lba, &payload(lba, op)).unwrap();
                expected[lba as usize] = Some(op);
            }
        }
        assert!(ftl.check());
        ftl.persist().unwrap();

        let mut restored = Ftl::new(ftl.into_flash()).unwrap();
        assert_eq!(restored.start().unwrap(), Started::Restored);
        assert!(restored.check());

        let mut out = [0u8; LBA_BYTES];
        for lba in 0..lbas {
            restored.read(lba, &mut out).unwrap();
            match expected[lba as usize] {
                Some(gen) => assert_eq!(out, payload(lba, gen), "lba {lba}"),
                None => assert_eq!(out, [0u8; LBA_BYTES], "lba {lba}"),
            }
        }
    }

    #[test]
    fn age_counter_commits_every_256_mutations() {
        let mut ftl = ftl_on_blank(128 * 1024);
        let lbas = ftl.lba_count();
        let mut expected: Vec<Option<u64>> = vec![None; lbas as usize];

        for op in 0..256u64 {
            let lba = (op % u64::from(lbas)) as u32;
            ftl.write(lba, &payload(lba, op)).unwrap();
            expected[lba as usize] = Some(op);
        }

        // No explicit persist: the 256th mutation committed on its own.
        let mut restored = Ftl::new(ftl.into_flash()).unwrap();
        assert_eq!(restored.start().unwrap(), Started::Restored);
        assert!(restored.check());

        let mut out = [0u8; LBA_BYTES];
        for lba in 0..lbas {
            restored.read(lba, &mut out).unwrap();
            match expected[lba as usize] {
                Some(gen) => assert_eq!(out, payload(lba, gen), "lba {lba}"),
                None => assert_eq!(out, [0u8; LBA_BYTES], "lba {lba}"),
            }
        }
    }

    #[test]
    fn torn_commit_falls_back_to_previous_epoch() {
        let mut ftl = ftl_on_blank(256 * 1024);
        for lba in 0..20 {
            ftl.write(lba, &payload(lba, 1)).unwrap();
        }
        ftl.persist().unwrap();

        // Newer writes land in a second snapshot...
        for lba in 0..10 {
            ftl.write(lba, &payload(lba, 2)).unwrap();
        }
        ftl.persist().unwrap();

        // ...which a simulated torn commit then destroys.
        let mut flash = ftl.into_flash();
        let newest = (0..64)
            .filter_map(|eb| codec::parse_frame(flash.read_eb(eb)).map(|(epoch, _)| epoch))
            .max()
            .unwrap();
        for eb in 0..64u32 {
            if matches!(codec::parse_frame(flash.read_eb(eb)), Some((epoch, _)) if epoch == newest)
            {
                flash
                    .program(eb, EB_BYTES - META_TRAILER_BYTES, &[0x55; META_TRAILER_BYTES])
                    .unwrap();
            }
        }

        let mut restored = Ftl::new(flash).unwrap();
        assert_eq!(restored.start().unwrap(), Started::Restored);
        assert!(restored.check());

        // The survivor is the first snapshot, before the rewrites.
        let mut out = [0u8; LBA_BYTES];
        for lba in 0..20 {
            restored.read(lba, &mut out).unwrap();
            assert_eq!(out, payload(lba, 1), "lba {lba}");
        }

        // And the device keeps working from there.
        restored.write(0, &payload(0, 3)).unwrap();
        restored.persist().unwrap();
        assert!(restored.check());
    }

    #[test]
    fn garbage_snapshots_do_not_restore() {
        // A block that merely starts with the signature but fails its CRC
        // must not be treated as metadata.
        let mut flash = SimFlash::new(256 * 1024);
        flash.program(10, 0, &codec::META_SIG).unwrap();
        let mut ftl = Ftl::new(flash).unwrap();
        assert_eq!(ftl.start().unwrap(), Started::Formatted);
        // format() purged the stale signature.
        assert!(!ftl.flash().read_eb(10).starts_with(&codec::META_SIG));
    }

    #[test]
    fn format_purges_stale_snapshots() {
        let mut ftl = ftl_on_blank(256 * 1024);
        for lba in 0..30 {
            ftl.write(lba, &payload(lba, 1)).unwrap();
        }
        ftl.persist().unwrap();
        ftl.format().unwrap();
        assert!(ftl.check());
        assert_eq!(ftl.valid_lba_count(), 0);

        for eb in 0..ftl.eb_count() {
            assert_eq!(codec::parse_frame(ftl.flash().read_eb(eb)), None);
        }

        // With nothing left to restore, a fresh instance formats again.
        let mut again = Ftl::new(ftl.into_flash()).unwrap();
        assert_eq!(again.start().unwrap(), Started::Formatted);
    }

    #[test]
    fn aged_out_metadata_is_relocated_verbatim() {
        let mut ftl = ftl_on_blank(128 * 1024);
        ftl.persist().unwrap();
        let slots = ftl.metadata_blocks();
        assert_eq!(slots.len(), 2);

        // On this geometry the snapshot fits in one block, so exactly one
        // slot carries a sealed frame; the other was allocated but never
        // written.
        let sealed: Vec<bool> = slots
            .iter()
            .map(|&eb| codec::parse_frame(ftl.flash.read_eb(eb)).is_some())
            .collect();
        assert_eq!(sealed.iter().filter(|&&s| s).count(), 1);
        let aged_idx = sealed.iter().position(|&s| s).unwrap();
        let aged = slots[aged_idx];
        let kept = slots[1 - aged_idx];
        let frame = codec::parse_frame(ftl.flash.read_eb(aged));

        // Age the whole device past the sealed block; keep the other slot
        // at the wear front so only one relocation fires.
        for eb in 0..ftl.eb_count() {
            if eb != aged {
                ftl.pe.load_count(eb, MAX_PE_DIFF as u8);
            }
        }
        ftl.pe.load_count(aged, 0);
        ftl.meta_age_rewrite().unwrap();

        let new_slots = ftl.metadata_blocks();
        let moved_to = new_slots[aged_idx];
        assert_ne!(moved_to, aged);
        assert_eq!(new_slots[1 - aged_idx], kept);
        assert_eq!(ftl.states.get(aged), 0);
        assert!(ftl.states.is_meta(moved_to));
        // The copy is byte-identical, CRC included.
        assert_eq!(codec::parse_frame(ftl.flash.read_eb(moved_to)), frame);
        assert!(ftl.check());
    }

    #[test]
    fn check_catches_a_broken_aggregate() {
        let mut ftl = ftl_on_blank(256 * 1024);
        ftl.write(0, &payload(0, 1)).unwrap();
        assert!(ftl.check());
        ftl.empty_ebs += 1;
        assert!(!ftl.check());
        ftl.empty_ebs -= 1;
        ftl.valid_lbas += 1;
        assert!(!ftl.check());
        ftl.valid_lbas -= 1;
        assert!(ftl.check());
    }

    /// A hot-region workload: a quarter of the device is written once and
    /// never again, the rest is hammered. Wear must still converge, the PE
    /// offset must advance through renormalization, and every consistency
    /// check along the way must hold.
    #[test]
    fn wear_levels_under_a_hot_region() {
        let mut ftl = ftl_on_blank(128 * 1024);
        let lbas = ftl.lba_count();

        for lba in 0..lbas / 4 {
            ftl.write(lba, &payload(lba, 0)).unwrap();
        }

        let hot = lbas - lbas / 4;
        let mut rng = StdRng::seed_from_u64(42);
        for op in 0..50_000u64 {
            let lba = lbas / 4 + rng.gen_range(0..hot);
            if op % 100 == 0 {
                ftl.trim(lba).unwrap();
            } else {
                ftl.write(lba, &payload(lba, op)).unwrap();
            }
            if op % 2000 == 0 {
                assert!(ftl.check(), "consistency lost at op {op}");
            }
        }
        assert!(ftl.check());

        // The static quarter is still intact.
        let mut out = [0u8; LBA_BYTES];
        for lba in 0..lbas / 4 {
            ftl.read(lba, &mut out).unwrap();
            assert_eq!(out, payload(lba, 0), "static lba {lba}");
        }

        // Renormalization must have kicked in by now.
        assert!(ftl.pe_count_offset() > 0);
        assert_eq!(ftl.pe_count_offset() % MAX_PE_DIFF, 0);

        // Divergence bounded across *all* blocks, metadata included.
        let max = (0..ftl.eb_count()).map(|eb| ftl.pe_count(eb)).max().unwrap();
        let min = (0..ftl.eb_count()).map(|eb| ftl.pe_count(eb)).min().unwrap();
        assert!(
            u32::from(max - min) <= MAX_PE_DIFF + 1,
            "wear diverged: {min}..{max}"
        );
    }
}
