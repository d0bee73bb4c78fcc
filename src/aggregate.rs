//! Cumulative n-best aggregation across iterations.
//!
//! The batch learners train on every hypothesis any iteration has ever
//! produced, so each decode's lists are merged into one cumulative,
//! deduplicated collection. The merge walks the existing accumulation
//! and the fresh decode together, per sentence:
//!
//! - Hypotheses already accumulated are kept in their original
//!   positions. Each one is matched against the fresh list and the
//!   matched occurrence is removed there, so a hypothesis the decoder
//!   re-finds is not duplicated.
//! - Whatever survives in the fresh list is genuinely novel and is
//!   appended at the end of the sentence's list.
//!
//! Duplicate identity is surface text plus bit-exact feature tuple:
//! the same string with different feature values is a new hypothesis,
//! because feature values shift between decodes under different
//! weights. Matching is count-aware, so a list that contains the same
//! candidate twice stays stable under re-merge.
//!
//! The resulting invariants - the accumulation only ever grows, a
//! re-merge of the same decode adds nothing, existing order is
//! preserved - are what make the stopping rule ("no new hypotheses
//! means no new information") sound.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::types::Hypothesis;

/// The cumulative per-sentence hypothesis collection for a run.
#[derive(Debug, Clone)]
pub struct AggregateState {
    sentences: Vec<Vec<Hypothesis>>,
    total: usize,
}

impl AggregateState {
    /// Empty accumulation for a corpus of `n_sents` sentences.
    pub fn new(n_sents: usize) -> Self {
        Self {
            sentences: vec![Vec::new(); n_sents],
            total: 0,
        }
    }

    /// Number of source sentences (fixed for the run).
    pub fn n_sentences(&self) -> usize {
        self.sentences.len()
    }

    /// Total accumulated hypothesis count; non-decreasing across merges.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Accumulated hypotheses for one sentence, in stable order.
    pub fn sentence(&self, sent: usize) -> &[Hypothesis] {
        &self.sentences[sent]
    }

    /// Drop all accumulated hypotheses (aggregation-off mode only).
    pub fn clear(&mut self) {
        for s in &mut self.sentences {
            s.clear();
        }
        self.total = 0;
    }

    /// Merge one decode's per-sentence lists into the accumulation.
    ///
    /// Returns the number of genuinely novel hypotheses. The decode
    /// must cover exactly the corpus's sentence count; anything else
    /// means the decoder and the run disagree about the corpus, which
    /// is fatal.
    pub fn merge(&mut self, decoded: Vec<Vec<Hypothesis>>) -> Result<usize> {
        if decoded.len() != self.sentences.len() {
            bail!(
                "inconsistent decode output: {} sentences, corpus has {}",
                decoded.len(),
                self.sentences.len()
            );
        }

        let mut novel_total = 0;
        for (sent, fresh) in decoded.into_iter().enumerate() {
            let existing = &mut self.sentences[sent];
            let mut used = vec![false; fresh.len()];

            // Existing hypotheses stay put; strike their occurrences
            // from the fresh list, one match per occurrence.
            for hyp in existing.iter() {
                if let Some(i) =
                    (0..fresh.len()).find(|&i| !used[i] && hyp.same_candidate(&fresh[i]))
                {
                    used[i] = true;
                }
            }

            // Survivors are novel; append in decode order.
            for (i, cand) in fresh.into_iter().enumerate() {
                if !used[i] {
                    debug_assert_eq!(cand.sent, sent);
                    existing.push(cand);
                    novel_total += 1;
                }
            }
        }

        self.total += novel_total;
        Ok(novel_total)
    }

    /// Write the accumulation to the cumulative n-best and ffvals files
    /// consumed by the external learners: `<sent>\t<text>` lines and
    /// tab-separated feature lines, in sentence order.
    pub fn write_files(&self, nb_path: &Path, ff_path: &Path) -> Result<()> {
        let mut nb = BufWriter::new(
            File::create(nb_path)
                .with_context(|| format!("creating {}", nb_path.display()))?,
        );
        let mut ff = BufWriter::new(
            File::create(ff_path)
                .with_context(|| format!("creating {}", ff_path.display()))?,
        );
        for (sent, hyps) in self.sentences.iter().enumerate() {
            for hyp in hyps {
                writeln!(nb, "{}\t{}", sent, hyp.text)?;
                let feats = hyp
                    .feats
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("\t");
                writeln!(ff, "{}\t{}", sent, feats)?;
            }
        }
        nb.flush()?;
        ff.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hyp(sent: usize, text: &str, feats: &[f64]) -> Hypothesis {
        Hypothesis {
            sent,
            text: text.to_string(),
            feats: feats.to_vec(),
            pal: None,
        }
    }

    fn texts(state: &AggregateState, sent: usize) -> Vec<String> {
        state
            .sentence(sent)
            .iter()
            .map(|h| h.text.clone())
            .collect()
    }

    #[test]
    fn test_first_merge_appends_everything() {
        let mut st = AggregateState::new(2);
        let novel = st
            .merge(vec![
                vec![hyp(0, "a", &[1.0]), hyp(0, "b", &[2.0])],
                vec![hyp(1, "c", &[3.0])],
            ])
            .unwrap();
        assert_eq!(novel, 3);
        assert_eq!(st.len(), 3);
    }

    #[test]
    fn test_idempotent_merge() {
        let decode = vec![
            vec![hyp(0, "a", &[1.0]), hyp(0, "b", &[2.0])],
            vec![hyp(1, "c", &[3.0])],
        ];
        let mut st = AggregateState::new(2);
        st.merge(decode.clone()).unwrap();
        let before: Vec<_> = (0..2).map(|s| texts(&st, s)).collect();

        let novel = st.merge(decode).unwrap();
        assert_eq!(novel, 0);
        assert_eq!(st.len(), 3);
        let after: Vec<_> = (0..2).map(|s| texts(&st, s)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_monotonic_growth_and_order_preservation() {
        let mut st = AggregateState::new(1);
        st.merge(vec![vec![hyp(0, "a", &[1.0]), hyp(0, "b", &[2.0])]])
            .unwrap();
        let len_1 = st.len();

        // Second decode re-finds "b", drops "a", adds "c".
        let novel = st
            .merge(vec![vec![hyp(0, "b", &[2.0]), hyp(0, "c", &[3.0])]])
            .unwrap();
        assert_eq!(novel, 1);
        assert!(st.len() >= len_1);
        // existing relative order kept, novelty appended at the end
        assert_eq!(texts(&st, 0), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_feature_tuple_sensitivity() {
        let mut st = AggregateState::new(1);
        st.merge(vec![vec![hyp(0, "same text", &[1.0, 2.0])]]).unwrap();
        let novel = st
            .merge(vec![vec![hyp(0, "same text", &[1.0, 2.5])]])
            .unwrap();
        assert_eq!(novel, 1, "same text with shifted features is novel");
        assert_eq!(st.len(), 2);
    }

    #[test]
    fn test_count_aware_matching() {
        // A decode that legitimately contains the same candidate twice
        // stays stable when merged again.
        let decode = vec![vec![
            hyp(0, "dup", &[1.0]),
            hyp(0, "dup", &[1.0]),
        ]];
        let mut st = AggregateState::new(1);
        assert_eq!(st.merge(decode.clone()).unwrap(), 2);
        assert_eq!(st.merge(decode).unwrap(), 0);
        assert_eq!(st.len(), 2);
    }

    #[test]
    fn test_empty_sentence_padding() {
        let mut st = AggregateState::new(2);
        let novel = st
            .merge(vec![vec![], vec![hyp(1, "x", &[1.0])]])
            .unwrap();
        assert_eq!(novel, 1);
        assert!(st.sentence(0).is_empty());
    }

    #[test]
    fn test_sentence_count_mismatch_is_fatal() {
        let mut st = AggregateState::new(2);
        let err = st.merge(vec![vec![]]).unwrap_err();
        assert!(format!("{:#}", err).contains("inconsistent"));
    }

    #[test]
    fn test_write_files_format() {
        let dir = tempfile::tempdir().unwrap();
        let nb = dir.path().join("allnbests");
        let ff = dir.path().join("allffvals");
        let mut st = AggregateState::new(2);
        st.merge(vec![
            vec![hyp(0, "a b", &[1.0, -2.0])],
            vec![hyp(1, "c", &[0.5, 0.25])],
        ])
        .unwrap();
        st.write_files(&nb, &ff).unwrap();
        assert_eq!(std::fs::read_to_string(&nb).unwrap(), "0\ta b\n1\tc\n");
        assert_eq!(
            std::fs::read_to_string(&ff).unwrap(),
            "0\t1\t-2\n1\t0.5\t0.25\n"
        );
    }
}
