use image::DynamicImage;
use serde::Serialize;
use tracing::debug;

use super::encode::encode_with;
use crate::config::{FILTER_OVER_FETCH_MULTIPLIER, UNFILTERED_FETCH_MARGIN};
use crate::corpus::{Kural, Pal, PalMeta};
use crate::index::VectorIndex;
use crate::state::ModelState;

/// A corpus entry matched against a query image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KuralMatch {
    #[serde(flatten)]
    pub kural: Kural,
    /// Cosine similarity with the query, in `[-1, 1]`.
    pub score: f32,
    pub pal_meta: PalMeta,
}

/// How strongly a match should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Strong,
    Good,
    Possible,
}

impl Confidence {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Strong => "Strong match",
            Self::Good => "Good match",
            Self::Possible => "Possible match",
        }
    }
}

impl KuralMatch {
    fn new(kural: &Kural, score: f32) -> Self {
        Self {
            kural: kural.clone(),
            score,
            pal_meta: kural.pal.meta(),
        }
    }

    /// Score as a whole percentage, truncated toward zero.
    ///
    /// Computed in `f64` so a stored `0.7f32` (just below 0.7) reads as 69.
    #[allow(clippy::cast_possible_truncation)]
    pub fn score_percent(&self) -> i32 {
        (f64::from(self.score) * 100.0) as i32
    }

    pub fn confidence(&self) -> Confidence {
        match self.score_percent() {
            70.. => Confidence::Strong,
            50..=69 => Confidence::Good,
            _ => Confidence::Possible,
        }
    }
}

/// Number of candidates to request from the index.
///
/// A Pal filter discards roughly two thirds of the candidates, so the search
/// over-fetches; without one a small margin absorbs invalid positions. Never
/// more than the index holds.
pub fn fetch_size(top_k: usize, filter: Option<Pal>, ntotal: usize) -> usize {
    let wanted = if filter.is_some() {
        top_k.saturating_mul(FILTER_OVER_FETCH_MULTIPLIER)
    } else {
        top_k.saturating_add(UNFILTERED_FETCH_MARGIN)
    };
    wanted.min(ntotal)
}

/// Retrieve the `top_k` Kurals closest to an image, optionally within one Pal.
///
/// The result is ordered by descending score and may be shorter than `top_k`
/// (even empty) when too few candidates pass the filter; that is not an error.
pub fn retrieve(
    state: &ModelState,
    image: &DynamicImage,
    top_k: usize,
    filter: Option<Pal>,
) -> anyhow::Result<Vec<KuralMatch>> {
    let models = state.models()?;
    debug!(top_k = top_k, filter = ?filter, "Retrieving Kurals");

    let query = encode_with(models, image)?;
    search_and_rank(&models.index, &models.kurals, &query, top_k, filter)
}

/// Search `index` with an already-encoded query and rank the hits.
///
/// `kurals[i]` must describe index vector `i`; positions outside `kurals`
/// are skipped. Scanning stops as soon as `top_k` matches are collected.
pub fn search_and_rank(
    index: &dyn VectorIndex,
    kurals: &[Kural],
    query: &[f32],
    top_k: usize,
    filter: Option<Pal>,
) -> anyhow::Result<Vec<KuralMatch>> {
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let fetch_k = fetch_size(top_k, filter, index.ntotal());
    let candidates = index.search(query, fetch_k)?;
    debug!(
        fetch_k = fetch_k,
        candidates = candidates.len(),
        "Candidates fetched"
    );

    let mut matches = Vec::with_capacity(top_k);
    for (score, position) in candidates.iter() {
        let Some(kural) = usize::try_from(position)
            .ok()
            .and_then(|i| kurals.get(i))
        else {
            continue;
        };
        if filter.is_some_and(|pal| kural.pal != pal) {
            continue;
        }

        matches.push(KuralMatch::new(kural, score));
        if matches.len() == top_k {
            break;
        }
    }

    debug!(matched = matches.len(), "Ranking completed");
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ArtifactPaths;
    use crate::corpus::Pal::{Love, Virtue, Wealth};
    use crate::error::KuralError;
    use crate::index::SearchResult;
    use crate::index::flat::FlatIpIndex;
    use crate::test_util::{FakeProvider, QUERY_RGB, TEST_CONFIG, loaded_state, solid_image};

    const SCENARIO_PALS: [Pal; 5] = [Virtue, Wealth, Virtue, Love, Virtue];
    const SCENARIO_SCORES: [f32; 5] = [0.9, 0.8, 0.7, 0.6, 0.5];

    fn kurals(pals: &[Pal]) -> Vec<Kural> {
        pals.iter()
            .zip(1u32..)
            .map(|(&pal, number)| Kural {
                number,
                kural_tamil: format!("குறள் {number}"),
                explanation: format!("Explanation {number}"),
                commentary_sp: None,
                commentary_mv: None,
                commentary_mk: None,
                pal,
                chapter: String::new(),
                section: String::new(),
            })
            .collect()
    }

    /// 2-d index where vector `i` scores exactly `scores[i]` against `[1, 0]`.
    fn index_with_scores(scores: &[f32]) -> FlatIpIndex {
        let vectors = scores
            .iter()
            .flat_map(|&s| [s, (1.0 - s * s).sqrt()])
            .collect();
        FlatIpIndex::from_vectors(2, vectors).unwrap()
    }

    fn scenario(top_k: usize, filter: Option<Pal>) -> Vec<KuralMatch> {
        search_and_rank(
            &index_with_scores(&SCENARIO_SCORES),
            &kurals(&SCENARIO_PALS),
            &[1.0, 0.0],
            top_k,
            filter,
        )
        .unwrap()
    }

    fn numbers(matches: &[KuralMatch]) -> Vec<u32> {
        matches.iter().map(|m| m.kural.number).collect()
    }

    /// Index stub recording the requested `k`.
    struct RecordingIndex {
        ntotal: usize,
        requested: std::sync::Mutex<Vec<usize>>,
        result: SearchResult,
    }

    impl VectorIndex for RecordingIndex {
        fn dimension(&self) -> usize {
            2
        }

        fn ntotal(&self) -> usize {
            self.ntotal
        }

        fn search(&self, _query: &[f32], k: usize) -> anyhow::Result<SearchResult> {
            self.requested.lock().unwrap().push(k);
            Ok(self.result.clone())
        }
    }

    #[test]
    fn fetch_size_over_fetches_only_when_filtering() {
        assert_eq!(fetch_size(5, Some(Virtue), 1330), 20);
        assert_eq!(fetch_size(5, None, 1330), 7);
        assert_eq!(fetch_size(5, Some(Love), 12), 12);
        assert_eq!(fetch_size(5, None, 3), 3);
    }

    #[test]
    fn filtered_scenario_returns_virtue_positions_in_order() {
        let matches = scenario(2, Some(Virtue));

        assert_eq!(numbers(&matches), vec![1, 3]);
        assert_eq!(
            matches.iter().map(|m| m.score).collect::<Vec<_>>(),
            vec![0.9, 0.7]
        );
        assert!(matches.iter().all(|m| m.pal_meta == Virtue.meta()));
    }

    #[test]
    fn filter_exhaustion_returns_partial_result() {
        let matches = scenario(3, Some(Love));

        assert_eq!(numbers(&matches), vec![4]);
        assert_eq!(matches[0].score, 0.6);
        assert_eq!(matches[0].pal_meta, Love.meta());
    }

    #[test]
    fn unfiltered_returns_at_most_k_by_non_increasing_score() {
        let matches = scenario(3, None);

        assert_eq!(numbers(&matches), vec![1, 2, 3]);
        assert!(matches.windows(2).all(|w| w[0].score >= w[1].score));

        let all = scenario(10, None);
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn filter_returns_only_requested_pal() {
        for pal in Pal::ALL {
            let matches = scenario(5, Some(pal));
            let expected = SCENARIO_PALS.iter().filter(|p| **p == pal).count();
            assert_eq!(matches.len(), expected);
            assert!(matches.iter().all(|m| m.kural.pal == pal));
        }
    }

    #[test]
    fn filter_matching_nothing_is_empty_not_error() {
        let matches = search_and_rank(
            &index_with_scores(&[0.9, 0.8]),
            &kurals(&[Virtue, Virtue]),
            &[1.0, 0.0],
            3,
            Some(Wealth),
        )
        .unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn zero_top_k_returns_empty() {
        assert!(scenario(0, None).is_empty());
    }

    #[test]
    fn positions_outside_metadata_are_skipped() {
        let index = RecordingIndex {
            ntotal: 5,
            requested: std::sync::Mutex::new(Vec::new()),
            result: SearchResult {
                scores: vec![0.95, 0.9, 0.8, 0.7],
                positions: vec![-1, 7, 1, 0],
            },
        };

        let matches =
            search_and_rank(&index, &kurals(&[Virtue, Wealth]), &[1.0, 0.0], 2, None).unwrap();

        assert_eq!(numbers(&matches), vec![2, 1]);
        assert_eq!(*index.requested.lock().unwrap(), vec![4]);
    }

    #[test]
    fn stops_scanning_once_quota_is_met() {
        let index = RecordingIndex {
            ntotal: 100,
            requested: std::sync::Mutex::new(Vec::new()),
            result: SearchResult {
                scores: vec![0.9, 0.8, 0.7],
                positions: vec![0, 1, 2],
            },
        };

        let matches = search_and_rank(
            &index,
            &kurals(&[Love, Love, Love]),
            &[1.0, 0.0],
            1,
            Some(Love),
        )
        .unwrap();

        assert_eq!(numbers(&matches), vec![1]);
        assert_eq!(*index.requested.lock().unwrap(), vec![4]);
    }

    #[test]
    fn confidence_thresholds() {
        let at = |score| KuralMatch::new(&kurals(&[Virtue])[0], score);
        assert_eq!(at(0.71).confidence(), Confidence::Strong);
        assert_eq!(at(0.75).confidence(), Confidence::Strong);
        assert_eq!(at(0.55).confidence(), Confidence::Good);
        assert_eq!(at(0.499).confidence(), Confidence::Possible);
        assert_eq!(at(-0.2).confidence(), Confidence::Possible);
        assert_eq!(at(0.876).score_percent(), 87);
        assert_eq!(at(0.5).confidence(), Confidence::Good);
    }

    #[test]
    fn score_percent_truncates_the_widened_score() {
        let at = |score| KuralMatch::new(&kurals(&[Virtue])[0], score);
        assert_eq!(at(0.7).score_percent(), 69);
        assert_eq!(at(0.7).confidence(), Confidence::Good);
        assert_eq!(at(0.29).score_percent(), 28);
        assert_eq!(at(0.57).score_percent(), 56);
        assert_eq!(at(0.75).score_percent(), 75);
        assert_eq!(Confidence::Good.label(), "Good match");
    }

    #[test]
    fn match_serializes_flat_with_score_and_meta() {
        let m = KuralMatch::new(&kurals(&[Wealth])[0], 0.5);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["number"], 1);
        assert_eq!(json["pal"], "Wealth");
        assert_eq!(json["score"], 0.5);
        assert_eq!(json["pal_meta"]["emoji"], "💰");
    }

    // --- full pipeline ---

    #[test]
    fn retrieve_scenario_through_encoder() {
        let tmp = tempfile::tempdir().unwrap();
        let state = loaded_state(tmp.path(), &SCENARIO_PALS, &SCENARIO_SCORES);

        let matches = retrieve(&state, &solid_image(QUERY_RGB), 2, Some(Virtue)).unwrap();

        assert_eq!(numbers(&matches), vec![1, 3]);
        assert!((matches[0].score - 0.9).abs() < 1e-4);
        assert!((matches[1].score - 0.7).abs() < 1e-4);

        let love = retrieve(&state, &solid_image(QUERY_RGB), 3, Some(Love)).unwrap();
        assert_eq!(numbers(&love), vec![4]);
        assert!((love[0].score - 0.6).abs() < 1e-4);
    }

    #[test]
    fn planted_vector_retrieves_its_metadata_entry() {
        // Position 3 holds the query itself; every other vector is further away.
        let scores = [0.2, -0.4, 0.5, 1.0, 0.1, 0.3];
        let pals = [Wealth, Love, Virtue, Love, Virtue, Wealth];
        let tmp = tempfile::tempdir().unwrap();
        let state = loaded_state(tmp.path(), &pals, &scores);

        let matches = retrieve(&state, &solid_image(QUERY_RGB), 1, None).unwrap();

        assert_eq!(numbers(&matches), vec![4]);
        assert_eq!(matches[0].kural.explanation, "Explanation of kural 4");
        assert!((matches[0].score - 1.0).abs() < 1e-4);
    }

    #[test]
    fn retrieve_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let state = loaded_state(tmp.path(), &SCENARIO_PALS, &SCENARIO_SCORES);
        let image = solid_image(QUERY_RGB);

        let first = retrieve(&state, &image, 4, None).unwrap();
        let second = retrieve(&state, &image, 4, None).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn retrieve_before_load_is_not_initialized() {
        let tmp = tempfile::tempdir().unwrap();
        let state = ModelState::new(
            ArtifactPaths::in_dir(tmp.path()),
            FakeProvider::new(TEST_CONFIG.in_dim),
        );

        let err = retrieve(&state, &solid_image(QUERY_RGB), 5, None).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<KuralError>(),
            Some(KuralError::NotInitialized)
        ));
    }
}
