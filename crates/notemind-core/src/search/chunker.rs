//! Document chunking with proper Unicode support
//!
//! Notes are split at markdown heading boundaries, chat conversations per turn.

use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};

use super::config::ChunkingConfig;
use super::types::{chunk_id, Chunk, ChunkLocation, ChunkSet, ParentMeta};
use crate::{Conversation, Document, DocumentKind, Note, Role};

/// Splits documents into chunks.
/// All size calculations are based on **character count**, not byte count,
/// ensuring proper handling of Unicode (CJK, emoji, etc.)
#[derive(Debug, Clone)]
pub struct Chunker {
    /// Maximum chunk size in characters (not bytes)
    max_chunk_chars: usize,
    /// Overlap between consecutive parts of a section, in characters
    overlap_chars: usize,
    /// Trailing parts shorter than this merge into the previous part
    min_chunk_chars: usize,
    /// Chat turns shorter than this merge with an adjacent same-role turn
    min_turn_chars: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

/// A heading-delimited stretch of a note
struct Section {
    heading_path: Vec<String>,
    text: String,
}

/// Consecutive chat turns folded into one chunk
struct TurnGroup {
    first: usize,
    last: usize,
    role: Role,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    content: String,
}

impl Chunker {
    /// Create a new chunker with custom settings (in characters)
    pub fn new(max_chunk_chars: usize, overlap_chars: usize) -> Self {
        let defaults = ChunkingConfig::default();
        let max_chunk_chars = max_chunk_chars.max(1);
        Self {
            max_chunk_chars,
            overlap_chars: overlap_chars.min(max_chunk_chars - 1),
            min_chunk_chars: defaults.min_chunk_chars,
            min_turn_chars: defaults.min_turn_chars,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        let mut chunker = Self::new(config.max_chunk_chars, config.overlap_chars);
        chunker.min_chunk_chars = config.min_chunk_chars;
        chunker.min_turn_chars = config.min_turn_chars;
        chunker
    }

    pub fn chunk_document(&self, document: &Document) -> ChunkSet {
        match document {
            Document::Note(note) => self.chunk_note(note),
            Document::Chat(conversation) => self.chunk_conversation(conversation),
        }
    }

    /// Chunk a note: one chunk per heading section, sub-split when too long
    pub fn chunk_note(&self, note: &Note) -> ChunkSet {
        let parent = ParentMeta {
            title: note.title.trim().to_string(),
            tags: note.tags.clone(),
            source_url: note.source_url.clone(),
        };

        let mut chunks = Vec::new();
        let sections = Self::sections(&note.content);
        for (ordinal, section) in sections.into_iter().enumerate() {
            let parts = self.split_section(&section.text);
            let multi_part = parts.len() > 1;
            for (part_index, content) in parts.into_iter().enumerate() {
                let discriminator = multi_part.then_some(part_index);
                chunks.push(Chunk {
                    id: chunk_id(DocumentKind::Note, &note.id, ordinal, discriminator),
                    parent_id: note.id.clone(),
                    kind: DocumentKind::Note,
                    ordinal,
                    char_count: content.chars().count(),
                    content,
                    location: ChunkLocation::Note {
                        heading_path: section.heading_path.clone(),
                    },
                    parent: parent.clone(),
                });
            }
        }

        ChunkSet::new(chunks)
    }

    /// Chunk a conversation: one chunk per turn, tiny same-role runs merged
    pub fn chunk_conversation(&self, conversation: &Conversation) -> ChunkSet {
        let mut groups: Vec<TurnGroup> = Vec::new();

        for (index, turn) in conversation.turns.iter().enumerate() {
            let text = turn.content.trim();
            if text.is_empty() {
                continue;
            }

            if let Some(last) = groups.last_mut() {
                let short = last.content.chars().count() < self.min_turn_chars
                    || text.chars().count() < self.min_turn_chars;
                if last.role == turn.role && short {
                    last.content.push_str("\n\n");
                    last.content.push_str(text);
                    last.last = index;
                    continue;
                }
            }

            groups.push(TurnGroup {
                first: index,
                last: index,
                role: turn.role,
                timestamp: turn.timestamp,
                content: text.to_string(),
            });
        }

        let parent = ParentMeta {
            title: conversation.title.trim().to_string(),
            tags: Vec::new(),
            source_url: None,
        };

        let chunks = groups
            .into_iter()
            .map(|group| Chunk {
                id: chunk_id(DocumentKind::Chat, &conversation.id, group.first, None),
                parent_id: conversation.id.clone(),
                kind: DocumentKind::Chat,
                ordinal: group.first,
                char_count: group.content.chars().count(),
                content: group.content,
                location: ChunkLocation::Chat {
                    turn_index: group.first,
                    turn_end: group.last,
                    role: group.role,
                    timestamp: group.timestamp,
                },
                parent: parent.clone(),
            })
            .collect();

        ChunkSet::new(chunks)
    }

    /// Walk the markdown and cut it at every heading. Sections without body
    /// text are dropped.
    fn sections(content: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut heading_stack: Vec<(HeadingLevel, String)> = Vec::new();
        let mut current_text = String::new();

        let mut in_heading = false;
        let mut heading_level: Option<HeadingLevel> = None;
        let mut heading_text = String::new();

        let flush = |text: &mut String, stack: &[(HeadingLevel, String)], out: &mut Vec<Section>| {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                out.push(Section {
                    heading_path: stack.iter().map(|(_, t)| t.clone()).collect(),
                    text: trimmed.to_string(),
                });
            }
            text.clear();
        };

        for event in Parser::new(content) {
            match event {
                Event::Start(Tag::Heading { level, .. }) => {
                    flush(&mut current_text, &heading_stack, &mut sections);
                    in_heading = true;
                    heading_level = Some(level);
                    heading_text.clear();
                }
                Event::End(TagEnd::Heading(_)) => {
                    if let Some(level) = heading_level {
                        // Remove headings at same or deeper level
                        while let Some((last_level, _)) = heading_stack.last() {
                            if *last_level >= level {
                                heading_stack.pop();
                            } else {
                                break;
                            }
                        }
                        heading_stack.push((level, heading_text.trim().to_string()));
                    }
                    in_heading = false;
                    heading_level = None;
                    heading_text.clear();
                }
                Event::Text(text) => {
                    if in_heading {
                        heading_text.push_str(&text);
                    } else {
                        current_text.push_str(&text);
                    }
                }
                Event::Code(code) => {
                    if in_heading {
                        heading_text.push_str(&code);
                    } else {
                        current_text.push('`');
                        current_text.push_str(&code);
                        current_text.push('`');
                    }
                }
                Event::SoftBreak | Event::HardBreak => {
                    if in_heading {
                        heading_text.push(' ');
                    } else {
                        current_text.push('\n');
                    }
                }
                Event::End(TagEnd::Paragraph) | Event::End(TagEnd::CodeBlock) => {
                    current_text.push_str("\n\n");
                }
                Event::End(TagEnd::Item) => {
                    current_text.push('\n');
                }
                _ => {}
            }
        }

        flush(&mut current_text, &heading_stack, &mut sections);
        sections
    }

    /// Cut a section into parts of at most `max_chunk_chars`
    fn split_section(&self, text: &str) -> Vec<String> {
        let mut parts: Vec<String> = Vec::new();
        let mut rest = text.trim().to_string();

        while rest.chars().count() > self.max_chunk_chars {
            let (head, tail) = self.split_chunk(&rest);
            if !head.is_empty() {
                parts.push(head);
            }
            rest = tail;
        }

        if !rest.is_empty() {
            match parts.last_mut() {
                Some(last) if rest.chars().count() < self.min_chunk_chars => {
                    last.push_str("\n\n");
                    last.push_str(&rest);
                }
                _ => parts.push(rest),
            }
        }

        parts
    }

    /// Split text into (chunk, remainder) at a natural boundary.
    /// The remainder starts `overlap_chars` before the cut and is always
    /// shorter than the input.
    fn split_chunk(&self, text: &str) -> (String, String) {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.max_chunk_chars {
            return (text.trim().to_string(), String::new());
        }

        let window: String = chars[..self.max_chunk_chars].iter().collect();
        let cut = self
            .find_boundary(&window)
            .unwrap_or(self.max_chunk_chars);

        let head: String = chars[..cut].iter().collect();
        let tail: String = chars[cut - self.overlap_chars..].iter().collect();
        (head.trim().to_string(), tail.trim().to_string())
    }

    /// Char position just past the best boundary in the window. Boundaries
    /// at or before `overlap_chars` would not make progress.
    fn find_boundary(&self, window: &str) -> Option<usize> {
        let usable = |byte_pos: usize| {
            let char_pos = window[..byte_pos].chars().count();
            (char_pos > self.overlap_chars).then_some(char_pos)
        };

        // Paragraph
        if let Some(pos) = window.rfind("\n\n").and_then(usable) {
            return Some(pos);
        }

        // Sentence (supports CJK and latin terminators)
        let sentence_ends = ["。", "！", "？", ".\n", "!\n", "?\n", ". ", "! ", "? "];
        let sentence = sentence_ends
            .iter()
            .filter_map(|end| window.rfind(end).map(|pos| pos + end.len()))
            .max()
            .and_then(usable);
        if sentence.is_some() {
            return sentence;
        }

        // Clause
        let clause = window
            .char_indices()
            .filter(|(_, ch)| matches!(ch, '，' | '；' | '、' | ',' | ';'))
            .map(|(pos, ch)| pos + ch.len_utf8())
            .last()
            .and_then(usable);
        if clause.is_some() {
            return clause;
        }

        // Whitespace
        window.rfind(char::is_whitespace).and_then(usable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Turn;

    fn small_chunker(max: usize, overlap: usize) -> Chunker {
        Chunker::from_config(&ChunkingConfig {
            max_chunk_chars: max,
            overlap_chars: overlap,
            min_chunk_chars: 5,
            min_turn_chars: 20,
        })
    }

    #[test]
    fn test_single_paragraph_note() {
        let chunker = Chunker::default();
        let note = Note::new("n1", "Geography", "Paris is the capital of France");
        let set = chunker.chunk_note(&note);

        assert_eq!(set.chunk_ids, vec!["notechunk_n1_0"]);
        let chunk = &set.chunks[0];
        assert_eq!(chunk.content, "Paris is the capital of France");
        assert_eq!(chunk.char_count, 30);
        assert_eq!(chunk.parent.title, "Geography");
        assert!(chunk.heading_path().is_empty());
    }

    #[test]
    fn test_heading_path() {
        let chunker = Chunker::default();
        let content = "Intro text\n\n# Title\n\n## Section 1\n\nContent 1\n\n### Subsection\n\nContent 2\n\n## Section 2\n\nContent 3";
        let set = chunker.chunk_note(&Note::new("n", "", content));

        let paths: Vec<Vec<String>> = set
            .chunks
            .iter()
            .map(|c| c.heading_path().to_vec())
            .collect();
        assert_eq!(
            paths,
            vec![
                vec![],
                vec!["Title".to_string(), "Section 1".to_string()],
                vec![
                    "Title".to_string(),
                    "Section 1".to_string(),
                    "Subsection".to_string()
                ],
                vec!["Title".to_string(), "Section 2".to_string()],
            ]
        );
        assert_eq!(set.chunks[3].content, "Content 3");
        assert_eq!(set.chunks[3].ordinal, 3);
    }

    #[test]
    fn test_empty_documents_produce_no_chunks() {
        let chunker = Chunker::default();
        assert!(chunker.chunk_note(&Note::new("n", "Title only", "")).is_empty());
        assert!(chunker.chunk_note(&Note::new("n", "", "# Heading\n\n   ")).is_empty());
        assert!(chunker
            .chunk_conversation(&Conversation::new("c", "t", vec![]))
            .is_empty());
    }

    #[test]
    fn test_long_section_is_sub_split_with_overlap() {
        let chunker = small_chunker(60, 10);
        let content = "The first sentence is here. The second sentence follows it. \
                       A third sentence closes the paragraph. And one more for luck.";
        let set = chunker.chunk_note(&Note::new("n", "", content));

        assert!(set.len() > 1);
        for (i, chunk) in set.chunks.iter().enumerate() {
            assert_eq!(chunk.id, format!("notechunk_n_0_{}", i));
            assert!(chunk.char_count <= 60 + 5 + 2);
        }
        assert!(set.chunks[0].content.ends_with('.'));
    }

    #[test]
    fn test_chinese_content_splits_on_char_boundaries() {
        let chunker = small_chunker(20, 5);
        let content = "# 标题\n\n这是一段很长的中文内容，我们需要确保在切分时不会切到汉字中间。这对于处理多语言内容非常重要；否则会出现乱码。";
        let set = chunker.chunk_note(&Note::new("zh", "", content));

        assert!(set.len() > 1);
        for chunk in &set.chunks {
            assert_eq!(chunk.char_count, chunk.content.chars().count());
            assert_eq!(chunk.heading_path(), ["标题".to_string()]);
        }
    }

    #[test]
    fn test_text_without_boundaries_is_hard_cut() {
        let chunker = small_chunker(10, 3);
        let content = "x".repeat(35);
        let set = chunker.chunk_note(&Note::new("n", "", content));
        assert!(set.chunks.iter().all(|c| c.char_count <= 10 + 5 + 2));
        assert!(set.len() >= 4);
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let chunker = small_chunker(40, 8);
        let note = Note::new(
            "d",
            "Det",
            "# A\n\nSome words, then more words. Then a sentence.\n\n# B\n\nShort.",
        );
        assert_eq!(chunker.chunk_note(&note), chunker.chunk_note(&note));
    }

    #[test]
    fn test_chat_turns() {
        let chunker = Chunker::default();
        let conversation = Conversation::new(
            "c1",
            "Trip planning",
            vec![
                Turn::new(Role::User, "What should I see in Paris next spring?"),
                Turn::new(Role::Assistant, "The Louvre, Musée d'Orsay and a walk along the Seine."),
                Turn::new(Role::User, "   "),
                Turn::new(Role::User, "And where should I eat near the Marais?"),
            ],
        );
        let set = chunker.chunk_conversation(&conversation);

        assert_eq!(set.chunk_ids, vec!["chatchunk_c1_0", "chatchunk_c1_1", "chatchunk_c1_3"]);
        match &set.chunks[2].location {
            ChunkLocation::Chat {
                turn_index, role, ..
            } => {
                assert_eq!(*turn_index, 3);
                assert_eq!(*role, Role::User);
            }
            other => panic!("unexpected location {:?}", other),
        }
    }

    #[test]
    fn test_short_same_role_turns_merge() {
        let chunker = Chunker::default();
        let conversation = Conversation::new(
            "c2",
            "",
            vec![
                Turn::new(Role::User, "hi"),
                Turn::new(Role::User, "can you summarize the meeting notes from Monday?"),
                Turn::new(Role::Assistant, "ok"),
                Turn::new(Role::User, "thanks"),
            ],
        );
        let set = chunker.chunk_conversation(&conversation);

        assert_eq!(set.len(), 3);
        assert_eq!(
            set.chunks[0].content,
            "hi\n\ncan you summarize the meeting notes from Monday?"
        );
        match set.chunks[0].location {
            ChunkLocation::Chat {
                turn_index,
                turn_end,
                ..
            } => assert_eq!((turn_index, turn_end), (0, 1)),
            _ => panic!("expected chat location"),
        }
        // Different roles never merge, however short
        assert_eq!(set.chunks[1].content, "ok");
        assert_eq!(set.chunks[2].content, "thanks");
    }

    #[test]
    fn test_merged_chat_chunking_is_deterministic() {
        let chunker = small_chunker(60, 10);
        let conversation = Conversation::new(
            "c3",
            "Standup",
            vec![
                Turn::new(Role::User, "hey"),
                Turn::new(Role::User, "yo"),
                Turn::new(Role::User, "what did we decide about the release branch yesterday?"),
                Turn::new(Role::Assistant, "k"),
                Turn::new(Role::Assistant, "We cut it on Thursday after the freeze, then tag the candidate."),
                Turn::new(Role::User, "ty"),
            ],
        );

        let first = chunker.chunk_conversation(&conversation);
        let second = chunker.chunk_conversation(&conversation);
        assert_eq!(first, second);
        assert_eq!(first.chunk_ids, second.chunk_ids);
        assert!(first.chunks[0].content.starts_with("hey\n\nyo"));
    }

    #[test]
    fn test_index_text_includes_parent_fields() {
        let chunker = Chunker::default();
        let note = Note::new("n", "Travel", "# Europe\n\nParis in spring").with_tags(["trip"]);
        let set = chunker.chunk_note(&note);
        assert_eq!(set.chunks[0].index_text(), "Travel\ntrip\nEurope\nParis in spring");
    }
}
