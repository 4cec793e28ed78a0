use std::path::{Path, PathBuf};

/// Clean a name for use as a single path component by removing characters
/// that are invalid on common filesystems: `/`, `\`, `:`, `*`, `?`, `"`,
/// `<`, `>`, `|`, and control characters. Names that clean to nothing or
/// to a relative-path token become `_`.
pub fn clean_component(name: &str) -> String {
    let clean: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    let clean = clean.trim();
    match clean {
        "" | "." | ".." => "_".to_string(),
        _ => clean.to_string(),
    }
}

/// Local file name of a submission's image: `<submissionId>_<value>`.
pub fn image_name(submission_id: i64, value: &str) -> String {
    format!("{}_{}", submission_id, clean_component(value))
}

/// `<imagesRoot>/<assetUid>/<assetName>/<imageName>`
pub fn image_path(images_root: &Path, asset_uid: &str, asset_name: &str, image_name: &str) -> PathBuf {
    asset_dir(images_root, asset_uid, asset_name).join(clean_component(image_name))
}

/// `<root>/<assetUid>/<assetName>`, shared by the image tree and the
/// deleted-images holding area.
pub fn asset_dir(root: &Path, asset_uid: &str, asset_name: &str) -> PathBuf {
    root.join(clean_component(asset_uid))
        .join(clean_component(asset_name))
}

/// `<manifestRoot>/<assetUid>/<submissionId>`
pub fn manifest_dir(manifest_root: &Path, asset_uid: &str, submission_id: i64) -> PathBuf {
    manifest_root
        .join(clean_component(asset_uid))
        .join(submission_id.to_string())
}

/// `<manifestRoot>/<assetUid>/<submissionId>/<fieldAutoname>.json`
pub fn manifest_path(manifest_root: &Path, asset_uid: &str, submission_id: i64, field: &str) -> PathBuf {
    manifest_dir(manifest_root, asset_uid, submission_id)
        .join(format!("{}.json", clean_component(field)))
}
