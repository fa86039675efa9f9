//! # Statistics and Reports
//!
//! The store keeps running counters for allocation, paging and migration.
//! Reports are returned as lines of text; [`ChunkStore::log_stats`] sends
//! them to the `info` log and the CLI prints them.
//!
//! ## Report Kinds
//!
//! ```text
//! Summary              chunk/storage/region/paging/period/migration lines
//! Regions              one line per region
//! RegionMap            full chunk map of every region
//! Paging               page-out and page-in totals
//! RegionHistogram      region count (y) vs. region average deref (x)
//! PagingHistogram      page transfers (y) vs. region average deref (x)
//! FreeSpaceHistogram   free bytes (y) vs. region average deref (x)
//! ```
//!
//! ## Counters
//!
//! Per-period counters (`deref_count`, `deref_maxxed`, `creates`, `deletes`,
//! the three migration counters) are cleared by `new_period()`. Everything
//! else runs for the life of the store.
//!
//! ## Histogram Scaling
//!
//! Charts are 64 columns by 20 rows; each column sums four adjacent deref
//! buckets. When the tallest column dwarfs the others, the scale follows the
//! second or third tallest instead and clipped columns print their true
//! value above the bar.

use tracing::info;

use crate::chunk::header::SizeClass;
use crate::config::{HISTOGRAM_COLUMNS, HISTOGRAM_ROWS, REGION_CAPACITY, REGION_SIZE};
use crate::storage::region::Region;
use crate::store::ChunkStore;
use crate::validate::dump_region;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Summary,
    Regions,
    RegionMap,
    Paging,
    RegionHistogram,
    PagingHistogram,
    FreeSpaceHistogram,
}

impl StatsKind {
    pub const ALL: [StatsKind; 7] = [
        StatsKind::Summary,
        StatsKind::Regions,
        StatsKind::RegionMap,
        StatsKind::Paging,
        StatsKind::RegionHistogram,
        StatsKind::PagingHistogram,
        StatsKind::FreeSpaceHistogram,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StatsKind::Summary => "summary",
            StatsKind::Regions => "regions",
            StatsKind::RegionMap => "region-map",
            StatsKind::Paging => "paging",
            StatsKind::RegionHistogram => "region-histogram",
            StatsKind::PagingHistogram => "paging-histogram",
            StatsKind::FreeSpaceHistogram => "freespace-histogram",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassCounts {
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ChunkStats {
    pub short: ClassCounts,
    pub medium: ClassCounts,
    pub long: ClassCounts,
    pub page_out: u64,
    pub page_in: u64,
    pub period: u32,
    pub deref_count: u64,
    pub deref_maxxed: u64,
    pub creates: u64,
    pub deletes: u64,
    pub migrate_slide: u64,
    pub migrate_move: u64,
    pub migrate_away: u64,
    /// Page transfers bucketed by the region's average deref at the time.
    pub paging_histogram: [u64; 256],
}

impl Default for ChunkStats {
    fn default() -> Self {
        Self {
            short: ClassCounts::default(),
            medium: ClassCounts::default(),
            long: ClassCounts::default(),
            page_out: 0,
            page_in: 0,
            period: 0,
            deref_count: 0,
            deref_maxxed: 0,
            creates: 0,
            deletes: 0,
            migrate_slide: 0,
            migrate_move: 0,
            migrate_away: 0,
            paging_histogram: [0; 256],
        }
    }
}

impl ChunkStats {
    fn class_mut(&mut self, class: SizeClass) -> &mut ClassCounts {
        match class {
            SizeClass::Short => &mut self.short,
            SizeClass::Medium => &mut self.medium,
            SizeClass::Long => &mut self.long,
        }
    }

    pub fn record_alloc(&mut self, data_len: usize) {
        let counts = self.class_mut(SizeClass::for_data_len(data_len));
        counts.count += 1;
        counts.bytes += data_len as u64;
    }

    pub fn record_free(&mut self, data_len: usize) {
        let counts = self.class_mut(SizeClass::for_data_len(data_len));
        counts.count -= 1;
        counts.bytes -= data_len as u64;
    }

    pub fn record_paging(&mut self, average_deref: u8) {
        self.paging_histogram[usize::from(average_deref)] += 1;
    }

    /// Starts a new period and clears the per-period counters.
    pub fn reset_period(&mut self) {
        self.period += 1;
        self.deref_count = 0;
        self.deref_maxxed = 0;
        self.creates = 0;
        self.deletes = 0;
        self.migrate_slide = 0;
        self.migrate_move = 0;
        self.migrate_away = 0;
    }

    pub fn total_chunks(&self) -> u64 {
        self.short.count + self.medium.count + self.long.count
    }

    pub fn total_bytes(&self) -> u64 {
        self.short.bytes + self.medium.bytes + self.long.bytes
    }

    /// Header bytes spent on the allocated chunks.
    pub fn header_bytes(&self) -> u64 {
        self.short.count * SizeClass::Short.data_offset() as u64
            + self.medium.count * SizeClass::Medium.data_offset() as u64
            + self.long.count * SizeClass::Long.data_offset() as u64
    }
}

#[inline]
fn percent(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        0
    } else {
        part * 100 / whole
    }
}

fn class_line(class: SizeClass, counts: ClassCounts) -> String {
    let overhead = counts.count * class.data_offset() as u64;
    format!(
        "             {:10} {:<9} ({:10} bytes, {:10} ({:2}%) overhead)",
        counts.count,
        class.name().to_ascii_lowercase(),
        counts.bytes,
        overhead,
        percent(overhead, counts.bytes + overhead)
    )
}

/// Renders a 64x20 bar chart of a 256-bucket histogram.
pub fn render_histogram(legend: &str, histogram: &[u64; 256]) -> Vec<String> {
    let width = 256 / HISTOGRAM_COLUMNS;
    let columns: Vec<u64> = histogram
        .chunks(width)
        .map(|bucket| bucket.iter().sum())
        .collect();

    let (mut max, mut pen, mut ante) = (0u64, 0u64, 0u64);
    for &k in &columns {
        if k > max {
            ante = pen;
            pen = max;
            max = k;
        } else if k > pen {
            ante = pen;
            pen = k;
        } else if k > ante {
            ante = k;
        }
    }
    if ante < max / 2 {
        let scale = if pen < max / 2 && ante >= pen / 2 {
            pen
        } else {
            ante
        };
        // a lone spike would otherwise scale to nothing
        if scale > 0 {
            max = scale;
        }
    }
    let max = max.max(1);

    let rows = HISTOGRAM_ROWS as u64;
    let mut grid = vec![vec![b' '; HISTOGRAM_COLUMNS]; HISTOGRAM_ROWS];
    for (j, &k) in columns.iter().enumerate() {
        let height = (k * rows / max).min(rows) as usize;
        for row in grid.iter_mut().take(height) {
            row[j] = b'*';
        }
    }

    // clipped columns print their value over the top of the bar
    let mut reach = 0usize;
    for (j, &k) in columns.iter().enumerate() {
        if k <= max {
            continue;
        }
        let label = format!("({})", k);
        let (row, start) = if j < HISTOGRAM_COLUMNS / 2 {
            let row = if j < reach { HISTOGRAM_ROWS - 2 } else { HISTOGRAM_ROWS - 1 };
            reach = j + label.len() + 1;
            (row, j + 1)
        } else {
            let start = j.saturating_sub(label.len());
            let row = if start < reach { HISTOGRAM_ROWS - 2 } else { HISTOGRAM_ROWS - 1 };
            reach = j;
            (row, start)
        };
        for (i, byte) in label.bytes().enumerate() {
            if let Some(cell) = grid[row].get_mut(start + i) {
                *cell = byte;
            }
        }
    }

    let text = |row: &[u8]| String::from_utf8_lossy(row).into_owned();
    let mut lines = vec![String::new(), legend.to_string()];
    lines.push(format!("{:6} |{}", max, text(&grid[HISTOGRAM_ROWS - 1])));
    for row in grid[1..HISTOGRAM_ROWS - 1].iter().rev() {
        lines.push(format!("       |{}", text(row)));
    }
    lines.push(format!("     0 |{}", text(&grid[0])));
    lines.push(format!("       +{}", "-".repeat(HISTOGRAM_COLUMNS)));
    lines.push(format!("        0{:>31}{:>32}", "|", 255));
    lines
}

impl ChunkStore {
    pub fn stats(&self, kind: StatsKind) -> Vec<String> {
        let period = self.stats.period;
        match kind {
            StatsKind::Summary => self.summary_lines(),
            StatsKind::Regions => self.region_lines(),
            StatsKind::RegionMap => self
                .regions
                .iter()
                .enumerate()
                .flat_map(|(id, region)| {
                    let page = region.in_memory.map(|slot| self.cache.data(slot));
                    dump_region(id as u16, region, page, period)
                })
                .collect(),
            StatsKind::Paging => vec![self.paging_line()],
            StatsKind::RegionHistogram => {
                let mut histogram = [0u64; 256];
                for region in &self.regions {
                    histogram[usize::from(region.average_derefs(period))] += 1;
                }
                render_histogram("Chart number of regions (y) vs. references (x)", &histogram)
            }
            StatsKind::PagingHistogram => render_histogram(
                "Chart pages in/out (y) vs. references (x)",
                &self.stats.paging_histogram,
            ),
            StatsKind::FreeSpaceHistogram => {
                let mut histogram = [0u64; 256];
                for region in &self.regions {
                    histogram[usize::from(region.average_derefs(period))] +=
                        u64::from(region.free_bytes);
                }
                render_histogram("Chart region free space (y) vs. references (x)", &histogram)
            }
        }
    }

    pub fn log_stats(&self, kind: StatsKind) {
        for line in self.stats(kind) {
            info!("{}", line);
        }
    }

    fn summary_lines(&self) -> Vec<String> {
        let s = &self.stats;
        let mut lines = Vec::with_capacity(16);

        let total_bytes = s.total_bytes();
        let overhead = s.header_bytes();
        lines.push(format!(
            "Chunks:    {:10} allocated ({:10} bytes, {:10} ({:2}%) overhead)",
            s.total_chunks(),
            total_bytes,
            overhead,
            percent(overhead, total_bytes + overhead)
        ));
        lines.push(class_line(SizeClass::Short, s.short));
        lines.push(class_line(SizeClass::Medium, s.medium));
        lines.push(class_line(SizeClass::Long, s.long));

        let (free_count, free_bytes) = self.regions.iter().fold((0u64, 0u64), |acc, r| {
            (acc.0 + u64::from(r.free_count), acc.1 + u64::from(r.free_bytes))
        });
        let largest_sum: u64 = self
            .regions
            .iter()
            .map(|r| u64::from(r.largest_free_chunk))
            .sum();
        let fragmented = free_bytes - largest_sum;
        lines.push(format!(
            "           {:10} free      ({:10} bytes, {:10} ({:2}%) fragmented)",
            free_count,
            free_bytes,
            fragmented,
            percent(fragmented, free_bytes)
        ));

        let storage = (self.regions.len() * REGION_SIZE
            + self.regions.capacity() * std::mem::size_of::<Region>()) as u64;
        let capacity = (self.regions.len() * REGION_CAPACITY) as u64;
        lines.push(format!(
            "Storage:   {:10} total ({:2}% saturation)",
            storage,
            percent(capacity - free_bytes, capacity)
        ));
        lines.push(format!(
            "Regions:   {:10} total, {:8} cached",
            self.regions.len(),
            self.cache.len()
        ));
        lines.push(self.paging_line());
        lines.push(" ".to_string());
        lines.push(format!(
            "Period:    {:10} ({:10} accesses so far, {:10} chunks at max)",
            s.period, s.deref_count, s.deref_maxxed
        ));
        lines.push(format!(
            "Activity:  {:10} creates, {:10} deletes this period",
            s.creates, s.deletes
        ));
        lines.push(format!(
            "Migration: {:10} moves this period",
            s.migrate_slide + s.migrate_move
        ));
        lines.push(format!(
            "             {:10} slide    {:10} move",
            s.migrate_slide, s.migrate_move
        ));
        lines.push(format!(
            "             {:10} in region{:10} out of region",
            s.migrate_move as i64 - s.migrate_away as i64,
            s.migrate_away
        ));
        lines
    }

    fn paging_line(&self) -> String {
        format!(
            "Paging:    {:10} out, {:10} in",
            self.stats.page_out, self.stats.page_in
        )
    }

    fn region_lines(&self) -> Vec<String> {
        self.regions
            .iter()
            .enumerate()
            .map(|(id, r)| {
                format!(
                    "region:{:4}  #used:{:5}  #free:{:5}  fbytes:{:04x}  largest:{:04x}  deref:{:3}",
                    id,
                    r.used_count,
                    r.free_count,
                    r.free_bytes,
                    r.largest_free_chunk,
                    r.average_derefs(self.stats.period)
                )
            })
            .collect()
    }
}
