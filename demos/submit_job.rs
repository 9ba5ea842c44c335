use batch_lite::client::ApiClient;
use batch_lite::orchestrator::{DefinitionSubmission, SubmitRequest};
use batch_lite::scheduler::job::{Dependency, JobId};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "submit-job")]
#[command(about = "Submit a small chain of jobs to a batch-lite server")]
struct Args {
    /// Server address
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Job queue to submit into
    #[arg(long, default_value = "stress-ng-queue")]
    queue: String,

    /// Job definition to instantiate
    #[arg(long, default_value = "stress-ng-job-definition")]
    definition: String,

    /// Prefix for the generated job IDs
    #[arg(long, default_value = "demo")]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let client = ApiClient::new(args.addr.clone());

    // prepare -> array of 4 workers -> report
    let prepare = format!("{}-prepare", args.prefix);
    let fan_out = format!("{}-fan-out", args.prefix);
    let report = format!("{}-report", args.prefix);

    let first = DefinitionSubmission::new(prepare.clone(), args.queue.clone(), args.definition.clone());
    let id = client.submit(&SubmitRequest::Definition(first)).await?;
    println!("Submitted {}", id);

    let mut second = DefinitionSubmission::new(fan_out.clone(), args.queue.clone(), args.definition.clone());
    second.array_size = 4;
    second.dependencies = vec![Dependency {
        job_id: JobId::from(prepare.as_str()),
        tolerate_failure: false,
    }];
    let id = client.submit(&SubmitRequest::Definition(second)).await?;
    println!("Submitted {} (array of 4)", id);

    let mut third = DefinitionSubmission::new(report.clone(), args.queue, args.definition);
    third.dependencies = vec![Dependency {
        job_id: JobId::from(fan_out.as_str()),
        tolerate_failure: false,
    }];
    let id = client.submit(&SubmitRequest::Definition(third)).await?;
    println!("Submitted {}", id);

    for job_id in [prepare, fan_out, report] {
        let status = client.job_status(&job_id).await?;
        println!("{:<30} {}", job_id, status.run.state);
    }

    Ok(())
}
