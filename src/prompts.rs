//! Prompts for the LLM-assisted processors.
//!
//! Every prompt lives here so a wording change touches one place and tests
//! can inspect prompts without a running model. Block prompts receive the
//! block's crop as an image attachment plus its extracted text; document
//! prompts receive a JSON listing of the blocks they may correct.

/// Shared system prompt for every LLM-assisted processor.
pub const SYSTEM_PROMPT: &str = r#"You are an expert document analyst helping convert PDF pages into structured text.
You are given an image of one region of a page and the text a PDF parser extracted from it.
Follow the task instructions exactly and output ONLY what is asked for:
no commentary, no explanations, no surrounding markdown fences."#;

pub const TABLE_PROMPT: &str = r#"The image shows a table. The parser extracted the following text, which may be misaligned or incomplete:

{text}

Rewrite the table as a single HTML <table> element.
- Use <th> for header cells and <td> for body cells.
- Use colspan and rowspan where cells are merged.
- Preserve every value exactly as it appears in the image.
Output only the <table>...</table> element."#;

pub const TABLE_MERGE_PROMPT: &str = r#"Two tables were found on consecutive pages. Decide whether the second is a continuation of the first (same columns, no new header describing a different table).

First table:
{first}

Second table:
{second}

Answer with JSON only: {"merge": true} or {"merge": false}."#;

pub const FORM_PROMPT: &str = r#"The image shows a form. The parser extracted:

{text}

Rewrite the form as an HTML <table> with one row per field: the label in the first cell, the filled-in value (or empty) in the second.
Output only the <table>...</table> element."#;

pub const COMPLEX_REGION_PROMPT: &str = r#"The image shows a region with a complex layout. The parser extracted:

{text}

Rewrite the region as clean Markdown, keeping the reading order a human would use. Use Markdown tables for tabular content and LaTeX ($...$) for math."#;

pub const IMAGE_DESCRIPTION_PROMPT: &str = r#"Describe the image in two or three sentences for a reader who cannot see it.
Mention the kind of image (chart, diagram, photo, ...) and, for charts, the key values and trends.
Output only the description."#;

pub const EQUATION_PROMPT: &str = r#"The image shows a display equation. The parser extracted:

{text}

Write the equation in LaTeX. Output only the LaTeX, without $$ delimiters."#;

pub const HANDWRITING_PROMPT: &str = r#"The image shows handwritten text. Transcribe it as Markdown, preserving line breaks and emphasis. Mark illegible words as [illegible]."#;

pub const MATH_BLOCK_PROMPT: &str = r#"The image shows text with inline math. The parser extracted:

{text}

Rewrite it as Markdown, putting every mathematical expression in inline LaTeX ($...$). Keep the surrounding words unchanged."#;

pub const SECTION_HEADER_PROMPT: &str = r#"Below are the section headers of a document, in reading order, with the heading levels a heuristic assigned:

{headers}

Correct the levels so they reflect the document's real hierarchy (1 is the top level, at most 6).
Answer with JSON only: {"corrections": [{"id": "<header id>", "level": <new level>}]}.
List only headers whose level must change; answer {"corrections": []} when all are right."#;

pub const PAGE_CORRECTION_PROMPT: &str = r#"The image shows a full page. Its blocks, in reading order, are:

{blocks}

{instructions}

If a block has the wrong type, answer with JSON only: {"corrections": [{"id": "<block id>", "block_type": "<new type>"}]}.
Valid types: Text, SectionHeader, ListItem, Table, Picture, Figure, Caption, Code, Equation, Footnote, Form, Handwriting, PageHeader, PageFooter, TableOfContents, ComplexRegion.
Answer {"corrections": []} when nothing needs to change."#;

/// Fill `{name}` placeholders.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}
