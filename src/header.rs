//! An ordered, in-memory copy of a primary header.
//!
//! The cards are read and written by CFITSIO (see [`crate::fitsfile`]); this
//! is just the editable form we hand around in between. Keyword lookups are
//! case-insensitive: we uppercase whatever we're handed, since that is how
//! keywords are stored on disk.

use crate::value::Value;

/// Usable width of the text of a HISTORY card.
pub const HISTORY_WIDTH: usize = 72;

#[derive(Clone, Debug, PartialEq)]
pub enum Card {
    /// `KEYWORD = value / comment`. A `None` value is the FITS undefined value.
    Keyed {
        keyword: String,
        value: Option<Value>,
        comment: Option<String>,
    },

    /// `HISTORY`, `COMMENT` and blank-keyword cards.
    Commentary { keyword: String, text: String },
}

impl Card {
    pub fn keyed<K: AsRef<str>>(keyword: K, value: Value, comment: Option<String>) -> Self {
        Card::Keyed {
            keyword: keyword.as_ref().to_uppercase(),
            value: Some(value),
            comment,
        }
    }

    pub fn history<S: Into<String>>(text: S) -> Self {
        Card::Commentary {
            keyword: "HISTORY".to_owned(),
            text: text.into(),
        }
    }

    pub fn keyword(&self) -> &str {
        match self {
            Card::Keyed { keyword, .. } | Card::Commentary { keyword, .. } => keyword,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Header {
    cards: Vec<Card>,
}

impl Header {
    pub fn new() -> Self {
        Header::default()
    }

    pub fn from_cards(cards: Vec<Card>) -> Self {
        Header { cards }
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    fn position<K: AsRef<str>>(&self, keyword: K) -> Option<usize> {
        let keyword = keyword.as_ref().to_uppercase();

        self.cards
            .iter()
            .position(|c| matches!(c, Card::Keyed { keyword: k, .. } if *k == keyword))
    }

    /// Whether a keyed card with this keyword exists, even if its value is
    /// undefined.
    pub fn contains<K: AsRef<str>>(&self, keyword: K) -> bool {
        self.position(keyword).is_some()
    }

    /// Get the value of the first card with this keyword. Undefined values
    /// come back as `None`, just like absent keywords.
    pub fn get<K: AsRef<str>>(&self, keyword: K) -> Option<&Value> {
        match self.position(keyword).map(|i| &self.cards[i]) {
            Some(Card::Keyed { value, .. }) => value.as_ref(),
            _ => None,
        }
    }

    pub fn get_str<K: AsRef<str>>(&self, keyword: K) -> Option<&str> {
        self.get(keyword).and_then(|v| v.as_str())
    }

    /// Set a keyword, updating the first existing card in place (keeping its
    /// comment) or appending a new card.
    pub fn set<K: AsRef<str>, V: Into<Value>>(&mut self, keyword: K, value: V) {
        self.upsert(keyword, value.into(), None);
    }

    /// Like [`Self::set`], but also replaces the comment.
    pub fn set_with_comment<K: AsRef<str>, V: Into<Value>, C: Into<String>>(
        &mut self,
        keyword: K,
        value: V,
        comment: C,
    ) {
        self.upsert(keyword, value.into(), Some(comment.into()));
    }

    fn upsert<K: AsRef<str>>(&mut self, keyword: K, new_value: Value, new_comment: Option<String>) {
        match self.position(&keyword) {
            Some(i) => {
                if let Card::Keyed { value, comment, .. } = &mut self.cards[i] {
                    *value = Some(new_value);

                    if new_comment.is_some() {
                        *comment = new_comment;
                    }
                }
            }

            None => self.cards.push(Card::keyed(keyword, new_value, new_comment)),
        }
    }

    /// Remove every card with this keyword, returning the first value found.
    pub fn remove<K: AsRef<str>>(&mut self, keyword: K) -> Option<Value> {
        let keyword = keyword.as_ref().to_uppercase();
        let mut removed = None;

        self.cards.retain(|c| match c {
            Card::Keyed {
                keyword: k, value, ..
            } if *k == keyword => {
                if removed.is_none() {
                    removed = value.clone();
                }
                false
            }
            _ => true,
        });

        removed
    }

    /// Append HISTORY cards, wrapping long text over several cards.
    pub fn add_history<S: AsRef<str>>(&mut self, text: S) {
        let chars: Vec<char> = text.as_ref().chars().collect();

        if chars.is_empty() {
            self.cards.push(Card::history(""));
            return;
        }

        for chunk in chars.chunks(HISTORY_WIDTH) {
            self.cards.push(Card::history(chunk.iter().collect::<String>()));
        }
    }

    /// The text of all HISTORY cards, in order.
    pub fn history(&self) -> Vec<&str> {
        self.cards
            .iter()
            .filter_map(|c| match c {
                Card::Commentary { keyword, text } if keyword == "HISTORY" => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Iterate over the keywords and values of all cards with defined values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.cards.iter().filter_map(|c| match c {
            Card::Keyed {
                keyword,
                value: Some(v),
                ..
            } => Some((keyword.as_str(), v)),
            _ => None,
        })
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.iter().map(|(k, _)| k)
    }
}
