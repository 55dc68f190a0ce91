//! Prompt text and the nine grill rule sets.

use bbqscan_shared::{CoarseCategory, ProductRecord};
use rust_decimal::Decimal;

/// Instruction for the primary extraction of a leaflet page.
pub const EXTRACTION_PROMPT: &str = "\
You read promotional leaflets of Swiss grocery stores. For every product shown \
on the attached page, report the product name, the regular price, the reduced \
price, the discount in percent (if printed) and any discount conditions \
(for example \"per 100g\" or \"from 2 pieces\"). Report prices exactly as printed. \
Use null for anything that is not on the page. List products in reading order.";

/// System prompt for re-validating an existing extraction against the page.
pub const VALIDATION_SYSTEM_PROMPT: &str = "\
You are a quality controller for grocery price data. You receive a leaflet page \
and a list of products that was read from it and may contain mistakes. Check \
every listed product against the page and return the corrected values, keeping \
the order of the list. Use null for values the page does not show.";

/// Build the user message of a validation call: a header line plus one line per product.
pub fn validation_user_prompt(primary: &[ProductRecord]) -> String {
    let mut out = String::from(
        "Correct this list against the page.\n\
         product_name, original_price, discount_price, percentage_discount",
    );
    let show = |v: Option<Decimal>| v.map_or_else(|| "null".to_string(), |d| d.to_string());
    for record in primary {
        out.push('\n');
        out.push_str(&format!(
            "{}, {}, {}, {}",
            record.product_name,
            show(record.original_price),
            show(record.discount_price),
            show(record.percentage_discount),
        ));
    }
    out
}

/// System prompt for stage 1.
pub fn coarse_system_prompt() -> String {
    let labels: Vec<&str> = CoarseCategory::ALL.iter().map(|c| c.label()).collect();
    format!(
        "You sort barbecue-relevant products of Swiss grocery stores into categories.\n\
         You receive at most five product names, one per line. For each name, in the \
         same order, answer with exactly one category and a certainty between 0 and 100.\n\
         Allowed categories: {}.\n\
         Use \"Gemischt\" for products combining several kinds of meat, \
         \"Grillgemüse\" for vegetables, fruit and mushrooms typically put on a grill, \
         and \"other\" for everything that fits none of the above (drinks, sauces, \
         charcoal, bread, desserts, household goods).\n\
         Certainty: 90-100 for unambiguous names, 60-89 when the name only hints at \
         the category, below 60 when guessing.",
        labels.join(", ")
    )
}

/// Build the user message listing the names of a batch.
pub fn names_user_prompt(names: &[String]) -> String {
    format!("Products:\n{}", names.join("\n"))
}

const GRILL_PREAMBLE: &str = "\
You decide whether grocery products are meant to be grilled. You receive at most \
five product names, one per line. For each name, in the same order, answer \
is_grill (true or false) and certainty_is_grill between 0 and 100: 90-100 when \
the name clearly points to grilling, 60-89 when indicators are partial, 50-59 \
when there is little evidence either way.\n\nRules for this product group:\n";

/// Category-specific rules for stage 2. Unknown categories use the `Other` rules.
pub fn grill_rules(category: CoarseCategory) -> &'static str {
    match category {
        CoarseCategory::Poultry => "\
Grill products: breast fillets, thighs, drumsticks, wings, skewers, poultry \
sausages for grilling, marinated poultry steaks, minced poultry (patties can be \
formed from it).\n\
Not grill products: whole birds, breaded or pre-cooked products (nuggets, \
cordon bleu), cold cuts, poultry in sauce or ready meals.",
        CoarseCategory::Pork => "\
Grill products: neck and loin steaks, chops, spare ribs, belly slices, skewers, \
bratwurst, cervelat and other grill sausages, marinated pork, minced pork.\n\
Not grill products: roasts and large joints, ham, bacon for cooking, cured or \
dried sausages, schnitzel meant for breading, ready meals.",
        CoarseCategory::Beef => "\
Grill products: entrecôte, rib-eye, sirloin, rump and fillet steaks, flank and \
skirt, burgers and patties, minced beef, skewers, marinated beef.\n\
Not grill products: braising and stewing cuts, roasts, dried meat (Bündnerfleisch), \
carpaccio, corned beef, ready meals.",
        CoarseCategory::MixedMeat => "\
Grill products: mixed grill platters, mixed skewers, mixed minced meat, grill \
sausage assortments combining several kinds of meat.\n\
Not grill products: mixed cold cuts, pâtés, meat fondue or stew mixes, ready meals.",
        CoarseCategory::Cheese => "\
Grill products: grill and halloumi cheese, cheese meant for raclette on the grill, \
small camembert or brie sold for grilling, feta sold in grill trays.\n\
Not grill products: hard and sliced cheese, cream cheese, grated cheese, fondue \
mixes, cheese snacks.",
        CoarseCategory::FishSeafood => "\
Grill products: salmon, trout and tuna steaks or fillets, whole fish sold for \
grilling, prawns and shrimp skewers, scallops, marinated seafood.\n\
Not grill products: smoked fish, canned fish, breaded fish fingers, surimi, \
sushi, fish in sauce.",
        CoarseCategory::VegetarianSubstitute => "\
Grill products: plant-based burgers, sausages and steaks, tofu or tempeh meant \
for grilling, vegetarian skewers, marinated meat substitutes.\n\
Not grill products: plant-based cold cuts, spreads, nuggets, milk or yoghurt \
alternatives, ready meals.",
        CoarseCategory::GrillVegetables => "\
Grill products: corn on the cob, peppers, zucchini, eggplant, mushrooms, \
asparagus, tomatoes, onions, potatoes for the grill, vegetable skewers, pineapple \
and other fruit sold for grilling.\n\
Not grill products: salads and leafy greens, berries, citrus, root vegetables \
sold for storage, frozen or canned vegetables, pre-made salads.",
        CoarseCategory::Other => "\
Treat a product as a grill product only if its name explicitly says it is meant \
for the grill (for example \"grill\", \"BBQ\", \"skewer\"). Drinks, sauces, \
charcoal, bread, snacks, desserts and household goods are not grill products.",
    }
}

/// Full system prompt for stage 2 of one category.
pub fn grill_system_prompt(category: CoarseCategory) -> String {
    format!("{GRILL_PREAMBLE}{}", grill_rules(category))
}
