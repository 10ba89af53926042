use thumbgen_contracts::variations::GALLERY_SIZE;

/// Separator the analysis model is asked to place between prompts.
pub const PROMPT_DELIMITER: &str = "---";

/// Style suffixes for Free runs, applied in this order.
pub const FREE_STYLE_SUFFIXES: [&str; GALLERY_SIZE] = [
    "vibrant, professional style",
    "cinematic, modern style",
    "artistic, unique style",
];

pub fn styled_prompt(prompt: &str, suffix: &str) -> String {
    format!("{prompt} - {suffix}")
}

pub fn fallback_prompt(prompt: &str) -> String {
    format!("professional thumbnail: {prompt}, vibrant, dramatic lighting, high quality")
}

pub fn analysis_instruction(prompt: &str) -> String {
    format!(
        "Analyze this image and the user's request: \"{prompt}\".\n\n\
         Generate exactly {GALLERY_SIZE} highly detailed image generation prompts for \
         eye-catching video thumbnails.\n\n\
         Each prompt should be:\n\
         - 50-100 words and highly descriptive\n\
         - Explicit about style, lighting, colors and composition\n\
         - Based on the subject of the uploaded image\n\n\
         Output ONLY the {GALLERY_SIZE} prompts separated by \"{PROMPT_DELIMITER}\". No numbering."
    )
}

/// Every non-empty, trimmed segment in model order.
pub fn split_prompt_segments(text: &str) -> Vec<String> {
    text.split(PROMPT_DELIMITER)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keeps the first `GALLERY_SIZE` segments and pads with fallbacks.
pub fn pad_prompts(mut prompts: Vec<String>, user_prompt: &str) -> Vec<String> {
    prompts.truncate(GALLERY_SIZE);
    while prompts.len() < GALLERY_SIZE {
        prompts.push(fallback_prompt(user_prompt));
    }
    prompts
}

pub fn parse_generated_prompts(text: &str, user_prompt: &str) -> Vec<String> {
    pad_prompts(split_prompt_segments(text), user_prompt)
}
