//! Merge planning for multi-part recordings.
//!
//! Recordings of one event are split into parts named like `match_1`,
//! `match_2` (or `match part 2`, `Spiel-Teil-3`). The planner groups parts
//! by their normalized base name and directory, orders them by part index,
//! and lays out the concatenation:
//!
//! `part 1, title card, part 2, title card, part 3, ...`
//!
//! Title cards are encoded to match the recordings, so the final
//! concatenation is a stream copy. Planning is pure; the merge executor
//! performs the encoding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use camreel_common::MergeConfig;
use camreel_job_model::{Job, JobId, JobKind, JobStatus};
use serde::Serialize;

/// Words that may precede the part number (`match_part2`, `Spiel Teil 2`).
const PART_KEYWORDS: [&str; 4] = ["halbzeit", "half", "part", "teil"];

/// Longer digit runs are dates or counters, not part numbers.
const MAX_INDEX_DIGITS: usize = 3;

/// Suffix of merged output files.
pub const MERGED_SUFFIX: &str = "_complete";

fn is_separator(c: char) -> bool {
    matches!(c, '_' | '-' | ' ' | '.')
}

/// Split `stem` into its base name and trailing part index.
///
/// The index must be a short digit run separated from the base, optionally
/// with a part keyword in between. Returns `None` for names without a part
/// token.
pub fn split_part_index(stem: &str) -> Option<(&str, u32)> {
    let digits_start = stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let digits = &stem[digits_start..];
    if digits.is_empty() || digits.len() > MAX_INDEX_DIGITS {
        return None;
    }
    let index: u32 = digits.parse().ok()?;

    let head = &stem[..digits_start];
    let head_trimmed = head.trim_end_matches(is_separator);

    let keyword_base = PART_KEYWORDS.iter().find_map(|kw| {
        let cut = head_trimmed.len().checked_sub(kw.len())?;
        if !head_trimmed.is_char_boundary(cut) {
            return None;
        }
        let before = &head_trimmed[..cut];
        (head_trimmed[cut..].eq_ignore_ascii_case(kw) && before.ends_with(is_separator))
            .then_some(before)
    });

    let base_with_sep = match keyword_base {
        Some(before_keyword) => before_keyword,
        None if head_trimmed.len() < head.len() => head,
        None => return None,
    };
    if !base_with_sep.ends_with(is_separator) {
        return None;
    }
    let base = base_with_sep.trim_end_matches(is_separator);
    if base.is_empty() {
        return None;
    }
    Some((base, index))
}

fn normalize_base(base: &str) -> String {
    let mut out = String::with_capacity(base.len());
    let mut pending_sep = false;
    for c in base.chars() {
        if is_separator(c) {
            pending_sep = true;
        } else {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// One recording offered to the planner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeCandidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Raw recording; its name decides grouping.
    pub source: PathBuf,
    /// Encoded file that gets concatenated.
    pub output: PathBuf,
}

impl MergeCandidate {
    pub fn new(source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            job_id: None,
            source: source.into(),
            output: output.into(),
        }
    }

    /// Candidate for a finished MP4 convert job.
    pub fn from_job(job: &Job) -> Option<Self> {
        if job.kind != JobKind::Convert || job.status() != JobStatus::Done {
            return None;
        }
        let output = job.output_path.clone()?;
        let is_mp4 = output
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp4"));
        if !is_mp4 {
            return None;
        }
        Some(Self {
            job_id: Some(job.id),
            source: job.local_path()?.to_path_buf(),
            output,
        })
    }
}

/// A recording placed in a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePart {
    pub index: u32,
    #[serde(flatten)]
    pub candidate: MergeCandidate,
}

/// Two or more parts of the same event, ordered by part index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeGroup {
    /// Base name as spelled by the first part.
    pub base: String,
    pub dir: PathBuf,
    pub parts: Vec<MergePart>,
}

/// Synthesized segment shown between parts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitleCard {
    pub label: String,
    /// 1-based position of the part this card introduces.
    pub position: usize,
    pub duration_secs: u32,
    pub background: String,
    pub text_color: String,
}

/// One entry of a concatenation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Recording { path: PathBuf, index: u32 },
    TitleCard(TitleCard),
}

/// Ordered segments and the merged output path for one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcatPlan {
    pub output: PathBuf,
    pub segments: Vec<Segment>,
}

impl ConcatPlan {
    pub fn title_cards(&self) -> impl Iterator<Item = &TitleCard> {
        self.segments.iter().filter_map(|s| match s {
            Segment::TitleCard(card) => Some(card),
            Segment::Recording { .. } => None,
        })
    }

    pub fn recordings(&self) -> impl Iterator<Item = &Path> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Recording { path, .. } => Some(path.as_path()),
            Segment::TitleCard(_) => None,
        })
    }
}

impl MergeGroup {
    /// `<base>_complete.mp4` next to the first part's output.
    pub fn output_path(&self) -> PathBuf {
        let dir = self
            .parts
            .first()
            .and_then(|p| p.candidate.output.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dir.clone());
        dir.join(format!("{}{MERGED_SUFFIX}.mp4", self.base))
    }

    /// Lay out the concatenation with a title card before every part
    /// after the first.
    pub fn concat_plan(&self, merge: &MergeConfig) -> ConcatPlan {
        let mut segments = Vec::with_capacity(self.parts.len() * 2);
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                let position = i + 1;
                segments.push(Segment::TitleCard(TitleCard {
                    label: merge.title_for(position),
                    position,
                    duration_secs: merge.title_duration_secs,
                    background: merge.background.clone(),
                    text_color: merge.text_color.clone(),
                }));
            }
            segments.push(Segment::Recording {
                path: part.candidate.output.clone(),
                index: part.index,
            });
        }
        ConcatPlan {
            output: self.output_path(),
            segments,
        }
    }
}

/// Planner result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergePlan {
    /// Groups of two or more parts, in order of first appearance.
    pub groups: Vec<MergeGroup>,
    /// Candidates that are not part of any group, in input order.
    pub standalone: Vec<MergeCandidate>,
}

/// Group candidates into merge groups.
pub fn plan(candidates: impl IntoIterator<Item = MergeCandidate>) -> MergePlan {
    let mut order: Vec<(PathBuf, String)> = Vec::new();
    let mut buckets: HashMap<(PathBuf, String), (String, Vec<(usize, MergePart)>)> =
        HashMap::new();
    let mut standalone: Vec<(usize, MergeCandidate)> = Vec::new();

    for (seq, candidate) in candidates.into_iter().enumerate() {
        let stem = candidate
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some((base, index)) = split_part_index(&stem) else {
            standalone.push((seq, candidate));
            continue;
        };

        let dir = candidate
            .source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let key = (dir, normalize_base(base));
        let base = base.to_string();
        let entry = buckets.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            (base, Vec::new())
        });
        entry.1.push((seq, MergePart { index, candidate }));
    }

    let mut result = MergePlan::default();
    for key in order {
        let Some((base, parts)) = buckets.remove(&key) else {
            continue;
        };
        if parts.len() < 2 {
            standalone.extend(parts.into_iter().map(|(seq, p)| (seq, p.candidate)));
            continue;
        }
        let mut parts: Vec<MergePart> = parts.into_iter().map(|(_, p)| p).collect();
        parts.sort_by(|a, b| {
            a.index
                .cmp(&b.index)
                .then_with(|| a.candidate.source.cmp(&b.candidate.source))
        });
        tracing::debug!(base = %base, parts = parts.len(), "Merge group planned");
        result.groups.push(MergeGroup {
            base,
            dir: key.0,
            parts,
        });
    }

    standalone.sort_by_key(|(seq, _)| *seq);
    result.standalone = standalone.into_iter().map(|(_, c)| c).collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(names: &[&str]) -> Vec<MergeCandidate> {
        names
            .iter()
            .map(|n| {
                let source = PathBuf::from("/rec").join(n);
                let output = source.with_extension("mp4");
                MergeCandidate::new(source, output)
            })
            .collect()
    }

    #[test]
    fn test_split_part_index_forms() {
        assert_eq!(split_part_index("match_1"), Some(("match", 1)));
        assert_eq!(split_part_index("match-02"), Some(("match", 2)));
        assert_eq!(split_part_index("Spiel Teil 2"), Some(("Spiel", 2)));
        assert_eq!(split_part_index("match_part3"), Some(("match", 3)));
        assert_eq!(split_part_index("game.Half_2"), Some(("game", 2)));
    }

    #[test]
    fn test_split_part_index_rejects_non_parts() {
        assert_eq!(split_part_index("other"), None);
        assert_eq!(split_part_index("cam1"), None);
        assert_eq!(split_part_index("match_20260501"), None);
        assert_eq!(split_part_index("_1"), None);
        assert_eq!(split_part_index("behalf_2"), Some(("behalf", 2)));
    }

    #[test]
    fn test_plan_orders_parts_and_passes_singletons() {
        let result = plan(candidates(&["match_2.mjpg", "other.mjpg", "match_1.mjpg"]));
        assert_eq!(result.groups.len(), 1);
        let group = &result.groups[0];
        let indices: Vec<u32> = group.parts.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(result.standalone.len(), 1);
        assert_eq!(result.standalone[0].source, PathBuf::from("/rec/other.mjpg"));
    }

    #[test]
    fn test_lone_part_is_not_merged() {
        let result = plan(candidates(&["match_1.mjpg", "derby_1.mjpg", "derby_2.mjpg"]));
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].base, "derby");
        assert_eq!(result.standalone.len(), 1);
        assert_eq!(result.standalone[0].source, PathBuf::from("/rec/match_1.mjpg"));
    }

    #[test]
    fn test_different_directories_do_not_mix() {
        let list = vec![
            MergeCandidate::new("/a/match_1.mjpg", "/a/match_1.mp4"),
            MergeCandidate::new("/b/match_2.mjpg", "/b/match_2.mp4"),
        ];
        let result = plan(list);
        assert!(result.groups.is_empty());
        assert_eq!(result.standalone.len(), 2);
    }

    #[test]
    fn test_base_normalization_ignores_case_and_separators() {
        let result = plan(candidates(&["Final Match_1.mjpg", "final-match_2.mjpg"]));
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].base, "Final Match");
    }

    #[test]
    fn test_concat_plan_interleaves_title_cards() {
        let result = plan(candidates(&["m_1.mjpg", "m_2.mjpg", "m_3.mjpg"]));
        let concat = result.groups[0].concat_plan(&MergeConfig::default());

        assert_eq!(concat.output, PathBuf::from("/rec/m_complete.mp4"));
        assert_eq!(concat.segments.len(), 5);
        assert!(matches!(concat.segments[0], Segment::Recording { index: 1, .. }));
        let labels: Vec<&str> = concat.title_cards().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["2. Half", "3. Half"]);
        assert!(matches!(concat.segments[4], Segment::Recording { index: 3, .. }));
        assert_eq!(concat.recordings().count(), 3);
    }

    #[test]
    fn test_candidate_from_job_requires_done_mp4() {
        let mut job = Job::convert("/rec/m_1.mjpg");
        job.output_path = Some(PathBuf::from("/rec/m_1.mp4"));
        assert!(MergeCandidate::from_job(&job).is_none());
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Done).unwrap();
        let candidate = MergeCandidate::from_job(&job).unwrap();
        assert_eq!(candidate.job_id, Some(job.id));

        let mut avi = Job::convert("/rec/m_2.mjpg");
        avi.output_path = Some(PathBuf::from("/rec/m_2.avi"));
        avi.transition(JobStatus::Running).unwrap();
        avi.transition(JobStatus::Done).unwrap();
        assert!(MergeCandidate::from_job(&avi).is_none());
    }

    #[test]
    fn test_plan_serializes() {
        let result = plan(candidates(&["m_1.mjpg", "m_2.mjpg"]));
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"base\":\"m\""));
    }
}
