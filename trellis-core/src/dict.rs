//! External-collaborator interfaces: dictionary word lookups and the
//! tied-state (word → right-context slot count) mapping.
//!
//! The search core never loads model files itself; the acoustic/model layer
//! hands it these two views. `StaticDict` is a small in-memory impl used by
//! the demo binary and tests.

use std::collections::HashMap;

/// Numeric word ID, assigned by the dictionary.
pub type WordId = u32;

/// Numeric context-independent phone ID.
pub type PhoneId = u16;

/// Word lookups the search core needs from the model layer.
pub trait Dictionary: Send + Sync {
    /// Number of words in the dictionary.
    fn n_words(&self) -> usize;

    /// Spelling of a word.
    fn word(&self, wid: WordId) -> &str;

    /// Whether a word is a filler (silence, noise, breath…). Fillers are
    /// skipped when propagating the "real word" language-model state along
    /// a backpointer chain.
    fn is_filler(&self, wid: WordId) -> bool;

    /// Sentence-start word.
    fn start_wid(&self) -> WordId;

    /// Sentence-finish word.
    fn finish_wid(&self) -> WordId;

    /// Silence word.
    fn silence_wid(&self) -> WordId;

    /// Last phone of a word (drives cross-word triphone context).
    fn last_phone(&self, wid: WordId) -> PhoneId;

    /// Second-to-last phone of a word, if it has more than one.
    fn last2_phone(&self, wid: WordId) -> Option<PhoneId>;
}

/// Tied-state mapping: how many right-context score slots a word exit needs.
///
/// A word's exit score differs depending on the phone that follows it; each
/// backpointer entry reserves one slot per possible right context.
pub trait TiedStateMap: Send + Sync {
    fn rc_count(&self, wid: WordId) -> usize;
}

/// Every word gets the same number of right-context slots.
#[derive(Debug, Clone, Copy)]
pub struct UniformTiedStateMap {
    pub n_rc: usize,
}

impl UniformTiedStateMap {
    pub fn new(n_rc: usize) -> Self {
        Self { n_rc: n_rc.max(1) }
    }
}

impl TiedStateMap for UniformTiedStateMap {
    fn rc_count(&self, _wid: WordId) -> usize {
        self.n_rc
    }
}

struct WordDef {
    name: String,
    filler: bool,
    phones: Vec<PhoneId>,
}

/// In-memory dictionary with the three standard markers pre-registered.
pub struct StaticDict {
    words: Vec<WordDef>,
    by_name: HashMap<String, WordId>,
    start: WordId,
    finish: WordId,
    silence: WordId,
}

impl StaticDict {
    /// Create a dictionary containing only `<s>`, `</s>` and `<sil>`.
    pub fn new() -> Self {
        let mut dict = Self {
            words: Vec::new(),
            by_name: HashMap::new(),
            start: 0,
            finish: 0,
            silence: 0,
        };
        dict.start = dict.add_word("<s>", vec![0], true);
        dict.finish = dict.add_word("</s>", vec![0], true);
        dict.silence = dict.add_word("<sil>", vec![0], true);
        dict
    }

    /// Register a word and return its ID. Registering the same spelling
    /// twice returns the existing ID.
    pub fn add_word(&mut self, name: &str, phones: Vec<PhoneId>, filler: bool) -> WordId {
        if let Some(&wid) = self.by_name.get(name) {
            return wid;
        }
        let wid = self.words.len() as WordId;
        self.words.push(WordDef {
            name: name.to_string(),
            filler,
            phones: if phones.is_empty() { vec![0] } else { phones },
        });
        self.by_name.insert(name.to_string(), wid);
        wid
    }

    /// Look up a word ID by spelling.
    pub fn wid(&self, name: &str) -> Option<WordId> {
        self.by_name.get(name).copied()
    }
}

impl Default for StaticDict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary for StaticDict {
    fn n_words(&self) -> usize {
        self.words.len()
    }

    fn word(&self, wid: WordId) -> &str {
        &self.words[wid as usize].name
    }

    fn is_filler(&self, wid: WordId) -> bool {
        self.words[wid as usize].filler
    }

    fn start_wid(&self) -> WordId {
        self.start
    }

    fn finish_wid(&self) -> WordId {
        self.finish
    }

    fn silence_wid(&self) -> WordId {
        self.silence
    }

    fn last_phone(&self, wid: WordId) -> PhoneId {
        *self.words[wid as usize]
            .phones
            .last()
            .unwrap_or(&0)
    }

    fn last2_phone(&self, wid: WordId) -> Option<PhoneId> {
        let phones = &self.words[wid as usize].phones;
        if phones.len() >= 2 {
            Some(phones[phones.len() - 2])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_fillers() {
        let dict = StaticDict::new();
        assert!(dict.is_filler(dict.start_wid()));
        assert!(dict.is_filler(dict.finish_wid()));
        assert!(dict.is_filler(dict.silence_wid()));
        assert_eq!(dict.n_words(), 3);
    }

    #[test]
    fn add_word_is_idempotent() {
        let mut dict = StaticDict::new();
        let cat = dict.add_word("CAT", vec![1, 2, 3], false);
        assert_eq!(dict.add_word("CAT", vec![1, 2, 3], false), cat);
        assert_eq!(dict.word(cat), "CAT");
        assert!(!dict.is_filler(cat));
        assert_eq!(dict.last_phone(cat), 3);
        assert_eq!(dict.last2_phone(cat), Some(2));
    }

    #[test]
    fn single_phone_word_has_no_last2() {
        let mut dict = StaticDict::new();
        let a = dict.add_word("A", vec![7], false);
        assert_eq!(dict.last_phone(a), 7);
        assert_eq!(dict.last2_phone(a), None);
    }
}
