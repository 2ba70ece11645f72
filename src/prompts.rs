// Prompt templates for each pipeline stage.
//
// Prompts are kept SHORT and STRICT for token efficiency.

use rand::seq::SliceRandom;

/// Display-name pool for battle agents. Agents are stateless labels, not
/// persistent identities.
pub const AGENT_NAMES: [&str; 6] = ["Nova", "Cipher", "Apex", "Vortex", "Zenith", "Blaze"];

/// Draw two distinct agent names at random.
pub fn random_agent_pair() -> (&'static str, &'static str) {
    let mut rng = rand::thread_rng();
    let pair: Vec<&'static str> = AGENT_NAMES
        .choose_multiple(&mut rng, 2)
        .copied()
        .collect();
    (pair[0], pair[1])
}

pub const GENERATOR_SYSTEM: &str = "You are an elite code generator. Output ONLY clean, working code.
Rules:
- NO explanations, NO markdown, NO comments unless essential
- Code must be complete and runnable
- Choose optimal approach for the task
- Be concise but correct";

pub const REFINER_SYSTEM: &str = "You are a code refiner. Improve the given code.
Rules:
- Output ONLY the improved code
- Fix bugs, optimize, improve readability
- Keep same language and approach
- NO explanations";

pub const CRITIC_SYSTEM: &str = "You are a code critic. Analyze both solutions briefly.
Output JSON only:
{\"a\":{\"strengths\":\"...\",\"weaknesses\":\"...\"},\"b\":{\"strengths\":\"...\",\"weaknesses\":\"...\"}}
Be concise. Max 50 words per field.";

pub const JUDGE_SYSTEM: &str = "You are the final judge. Pick the winner based on:
- Correctness (40%)
- Code quality (30%)
- Efficiency (20%)
- Elegance (10%)

Output JSON only:
{\"winner\":\"A\"|\"B\",\"score_a\":0-100,\"score_b\":0-100,\"reason\":\"...\"}
Max 30 words for reason.";

pub fn generator_prompt(task: &str, agent_name: &str) -> String {
    format!("Task: {task}\n\nYou are {agent_name}. Generate optimal solution. CODE ONLY.")
}

pub fn refiner_prompt(code: &str) -> String {
    format!("Refine this code. Output improved version only:\n\n{code}")
}

pub fn critic_prompt(code_a: &str, code_b: &str) -> String {
    format!("Compare:\n\n[A]\n{code_a}\n\n[B]\n{code_b}")
}

pub fn judge_prompt(code_a: &str, code_b: &str, critique: &str) -> String {
    format!("[A]\n{code_a}\n\n[B]\n{code_b}\n\nCritique:\n{critique}\n\nPick winner.")
}
