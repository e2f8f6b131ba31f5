//! Embedded, static wear-leveling flash translation layer.
//!
//! Raw NOR flash programs in small granules but erases only in whole 4 KiB
//! blocks, and each block survives a bounded number of erase cycles. This
//! crate exposes a simple logical block device (512-byte LBAs) on top of such
//! a part: writes are remapped to spread wear across every block, fragmented
//! blocks are garbage-collected, and the translation tables themselves are
//! persisted to flash crash-consistently so that state survives power loss.
//!
//! The [`flash`] module defines the narrow capability a device driver must
//! provide (plus a RAM-backed simulator for host-side testing); the [`ftl`]
//! module contains the translation layer itself.

pub mod flash;
pub mod ftl;
