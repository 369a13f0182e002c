use crate::Paging;
use crate::page_table::{Level, PageTableEntry, TableIndex};
use crate::pmap::PmapCore;
use kernel_memory_addresses::VirtualAddress;
use log::info;

impl Paging {
    /// Log every level of the translation of `va`, stopping at the first hole.
    pub(crate) fn dump_walk(&self, core: &PmapCore, va: VirtualAddress) {
        info!("walk {va} (root {})", core.root());
        let mut level = Level::Pml4;
        let mut entry = self.with_top(core, |t| t.get(TableIndex::of(va, level)));
        loop {
            log_entry(level, TableIndex::of(va, level), entry);
            if !entry.present() {
                info!("  not mapped at {}", level.name());
                return;
            }
            let Some(next) = level.next() else {
                info!("  -> {}", entry.frame().base() + va.page_offset());
                return;
            };
            // SAFETY: read-only peek at a table linked from a present entry.
            entry = unsafe { self.mounts().mount(entry.frame()) }
                .table()
                .get(TableIndex::of(va, next));
            level = next;
        }
    }
}

fn log_entry(level: Level, idx: TableIndex, e: PageTableEntry) {
    info!(
        "  {:>4}[{:3}]={:016x} P={} RW={} US={} NX={}",
        level.name(),
        idx.as_usize(),
        e.into_bits(),
        u8::from(e.present()),
        u8::from(e.writable()),
        u8::from(e.user_access()),
        u8::from(e.no_execute()),
    );
}
