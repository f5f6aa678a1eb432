use super::PlacementHint;

pub const STYLE_FROM_IMAGE_SYSTEM: &str = "You are an expert in professional product photography. Analyze the reference image and focus ONLY on lighting techniques and background style that create clean, professional results. COMPLETELY IGNORE the garment positioning (flat-lay, hanging, worn, etc.), color, type, or specific details. Only describe lighting setup and background techniques that would create a clean, wrinkle-free, professional presentation. Provide a concise description (under 150 words) focusing on lighting and background only.";

pub const STYLE_FROM_IMAGE_USER: &str = "Describe ONLY the lighting techniques and background style in this image. DO NOT mention how the garment is positioned (flat-lay, hanging, etc.), garment color, type, or any specific garment details. Focus only on lighting setup and background techniques that create professional, clean results.";

pub const STYLE_FROM_TEXT_SYSTEM: &str = "You are an expert in product photography. Convert the user's style description into specific professional photography specifications (under 200 words) including lighting setup, background choice, and presentation style suitable for e-commerce.";

pub const CLASSIFY_SYSTEM: &str = "You are analyzing a garment reference image. Identify the garment type and where the design/logo is located. Give brief answers.";

pub const CLASSIFY_USER: &str = "1. What type of garment is this? (t-shirt, hoodie, sweatshirt, tank top, etc.)\n2. Where is the design/logo positioned? (front chest, back center, left chest, etc.)\n\nAnswer in format: 'Garment: [type] | Location: [position]'";

pub fn style_from_text(style_input: &str) -> String {
    format!(
        "Convert this style description into professional product photography specifications: \"{}\"",
        style_input.trim()
    )
}

/// The first input image is the subject; a second one, when sent, is the style reference.
pub fn blank_product(style: &str, product_description: Option<&str>, has_reference: bool) -> String {
    let mut prompt = String::from("Create a studio quality photo of the [first image].");
    if let Some(description) = product_description.map(str::trim).filter(|d| !d.is_empty()) {
        prompt.push_str(&format!(" The attached photo is {description}."));
    }
    if has_reference {
        prompt.push_str(" Create the final photo in the style of [reference image].");
    }
    prompt.push_str(&format!(" Photography style: {}.", style.trim().trim_end_matches('.')));
    prompt.push_str(" Remove design.");
    prompt
}

/// The first input image is the garment, the second the logo.
pub fn composite_logo(hint: &PlacementHint) -> String {
    let garment = &hint.garment_type;
    let location = &hint.placement_location;
    format!(
        "Add the logo from the second image onto the {location} of the {garment} from the first image. \
The {garment} must remain EXACTLY the same - same shape, same fabric texture, same lighting, same positioning, same structure. \
Only add the logo as a printed design on the fabric surface. \
Do not change the {garment}'s structure, fit, sleeves, or any other part. \
Simply place the logo design on the fabric."
    )
}
