use x86sim_common::Program;

/// Renders a loaded program with its instruction indices. Each label is
/// printed on its own line just above the instruction it binds to; labels
/// that bind past the last instruction come last.
pub fn render_listing(program: &Program) -> String {
    let mut lines = Vec::new();

    for (index, instruction) in program.instructions.iter().enumerate() {
        lines.extend(label_lines(program, |target| target == index));
        lines.push(format!("{index:04}  {instruction}"));
    }
    lines.extend(label_lines(program, |target| target >= program.len()));

    lines.join("\n")
}

fn label_lines<'a>(
    program: &'a Program,
    bound: impl Fn(usize) -> bool + 'a,
) -> impl Iterator<Item = String> + 'a {
    program
        .labels
        .iter()
        .filter(move |&(_, &target)| bound(target))
        .map(|(name, _)| format!("{name}:"))
}
