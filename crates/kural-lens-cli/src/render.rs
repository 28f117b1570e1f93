use std::io::{self, Write};

use kural_lens_lib::pipeline::retrieve::KuralMatch;

/// Write the text card for the `rank`-th match (1-based).
pub fn render_card(out: &mut impl Write, m: &KuralMatch, rank: usize) -> io::Result<()> {
    let kural = &m.kural;
    let chapter = if kural.chapter.is_empty() {
        "?"
    } else {
        kural.chapter.as_str()
    };

    writeln!(
        out,
        "{rank}. {} Kural #{} — {chapter}  [{}% · {}]",
        m.pal_meta.emoji,
        kural.number,
        m.score_percent(),
        m.confidence().label(),
    )?;
    writeln!(out, "   {}", kural.kural_tamil)?;
    writeln!(out, "   \"{}\"", kural.explanation)?;
    if !kural.section.is_empty() {
        writeln!(out, "   Section: {}", kural.section)?;
    }
    writeln!(out, "   Pal: {} ({})", kural.pal, m.pal_meta.tamil)?;
    if let Some(commentary) = kural.display_commentary() {
        writeln!(out, "   Commentary: {commentary}")?;
    }
    Ok(())
}

/// Header line above the cards.
pub fn render_header(count: usize) -> String {
    let plural = if count == 1 { "" } else { "s" };
    format!("Found {count} Kural{plural} matching your image\n")
}

pub const NO_MATCH: &str = "No strong match found for this filter.\n\
    Try `--pal all`, or use a clearer image of human activity.\n";
