//! Division of the genome into contiguous regions for parallel scanning

use std::fmt;

/// A contig declared in the genotype source header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contig {
    pub name: String,
    pub length: Option<u64>,
}

/// A contiguous interval of one contig, 0-based and inclusive.
/// `end == None` runs to the end of the contig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub contig: String,
    pub start: u64,
    pub end: Option<u64>,
}

impl Region {
    pub fn whole(contig: &str) -> Self {
        Region {
            contig: contig.to_string(),
            start: 0,
            end: None,
        }
    }

    /// Whether a record starting at the 0-based position belongs to this region
    pub fn contains_start(&self, pos: u64) -> bool {
        pos >= self.start && self.end.map_or(true, |end| pos <= end)
    }
}

impl fmt::Display for Region {
    /// 1-based, samtools-style region string
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}:{}-{}", self.contig, self.start + 1, end + 1),
            None if self.start == 0 => write!(f, "{}", self.contig),
            None => write!(f, "{}:{}-", self.contig, self.start + 1),
        }
    }
}

/// The ordered set of regions assigned to one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub regions: Vec<Region>,
}

impl Partition {
    fn new(index: usize) -> Self {
        Partition {
            index,
            regions: Vec::new(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regions: Vec<String> = self.regions.iter().map(|r| r.to_string()).collect();
        write!(f, "partition {} [{}]", self.index, regions.join(","))
    }
}

/// Split contigs into at most `parts` partitions of roughly equal length.
///
/// Partitions follow header contig order and together cover every contig.
/// The last piece of each contig is open-ended, and contigs without a
/// declared length (or declared with length 0) are assigned whole to the
/// partition being filled.
pub fn partition_contigs(contigs: &[Contig], parts: usize) -> Vec<Partition> {
    let parts = parts.max(1);
    let total: u64 = contigs.iter().filter_map(|c| c.length).sum();

    if parts == 1 || total == 0 {
        let regions = contigs.iter().map(|c| Region::whole(&c.name)).collect();
        return vec![Partition { index: 0, regions }];
    }

    let share = total.div_ceil(parts as u64).max(1);
    let mut partitions = Vec::new();
    let mut current = Partition::new(0);
    let mut filled = 0u64;

    for contig in contigs {
        let length = match contig.length {
            Some(length) if length > 0 => length,
            _ => {
                current.regions.push(Region::whole(&contig.name));
                continue;
            }
        };

        let mut start = 0u64;
        while start < length {
            // the final partition absorbs whatever remains
            let capacity = if partitions.len() + 1 < parts {
                share - filled
            } else {
                u64::MAX
            };
            let take = (length - start).min(capacity);
            let last_piece = start + take == length;
            current.regions.push(Region {
                contig: contig.name.clone(),
                start,
                end: if last_piece { None } else { Some(start + take - 1) },
            });
            start += take;
            filled += take;

            if filled == share && partitions.len() + 1 < parts {
                let index = current.index + 1;
                partitions.push(std::mem::replace(&mut current, Partition::new(index)));
                filled = 0;
            }
        }
    }

    if !current.regions.is_empty() {
        partitions.push(current);
    }

    partitions
}
