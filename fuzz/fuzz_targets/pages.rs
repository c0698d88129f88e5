#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pgbuddy::PageBuddy;

const DEPTH: usize = 7;
const PAGE_SIZE: usize = 64;
const MAX_ALLOC: usize = 32;

#[derive(Clone, Debug, Arbitrary)]
enum ArenaOp {
    Allocate(usize),
    Free(usize),
}

fuzz_target!(|ops: Vec<ArenaOp>| {
    let mut buddy: PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, _> = match PageBuddy::try_new() {
        Ok(buddy) => buddy,
        Err(_) => return,
    };

    let mut outstanding = Vec::new();

    for op in ops {
        match op {
            // Raw sizes reach the validation paths; most of them are
            // rejected as soft errors.
            ArenaOp::Allocate(pages) => {
                if let Ok(block) = buddy.allocate_pages(pages % 128) {
                    outstanding.push(block);
                }
            }

            ArenaOp::Free(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let block = outstanding.swap_remove(idx);
                unsafe { buddy.deallocate_pages(block) };
            }
        }
    }

    for block in outstanding {
        unsafe { buddy.deallocate_pages(block) };
    }
});
