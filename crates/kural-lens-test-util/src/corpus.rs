use std::path::{Path, PathBuf};

/// Build one metadata record in the on-disk JSON shape.
///
/// Text fields are derived from `number` so assertions can tell entries apart.
pub fn kural_json(number: u32, pal: &str) -> serde_json::Value {
    serde_json::json!({
        "number": number,
        "kural_tamil": format!("குறள் {number}"),
        "explanation": format!("Explanation of kural {number}"),
        "commentary_sp": format!("Commentary by Solomon Pappaiah on kural number {number}"),
        "commentary_mv": "",
        "pal": pal,
        "chapter": format!("Chapter {}", number.div_ceil(10)),
        "section": format!("Section of kural {number}"),
    })
}

/// Metadata records for the given Pals, numbered from 1 in order.
pub fn corpus_json(pals: &[&str]) -> Vec<serde_json::Value> {
    pals.iter()
        .zip(1u32..)
        .map(|(pal, number)| kural_json(number, pal))
        .collect()
}

/// Write a metadata JSON array to `kural_metadata.json` in the given directory.
///
/// Returns the path to the created file.
pub fn write_metadata(dir: &Path, entries: &[serde_json::Value]) -> PathBuf {
    let path = dir.join("kural_metadata.json");
    let json = serde_json::to_vec_pretty(entries).unwrap();
    std::fs::write(&path, json).unwrap();
    path
}
