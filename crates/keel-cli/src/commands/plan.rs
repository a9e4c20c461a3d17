use keel_rollout::{RolloutPlan, RolloutPlanner};

pub fn plan(
    current: u32,
    desired: u32,
    max_unavailable: u32,
    max_surge: u32,
    format: &str,
) -> anyhow::Result<()> {
    let plan = RolloutPlanner::plan(current, desired, max_unavailable, max_surge)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        _ => {
            println!("{}", format_plan(&plan));
        }
    }

    Ok(())
}

/// Human-readable plan listing.
pub fn format_plan(plan: &RolloutPlan) -> String {
    let mut out = format!(
        "Plan {} → {} replicas (max_unavailable {}, max_surge {}, floor {})\n",
        plan.current_replicas,
        plan.desired_replicas,
        plan.max_unavailable,
        plan.max_surge,
        plan.availability_floor()
    );
    if plan.is_empty() {
        out.push_str(&format!(
            "  no steps: already at {} replicas\n",
            plan.desired_replicas
        ));
    }
    for (i, step) in plan.steps.iter().enumerate() {
        out.push_str(&format!("  {:>2}. {step}\n", i + 1));
    }
    out
}
