// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use log::LevelFilter;

use chatsync::engine::{ChatEngine, EngineOptions};
use chatsync::services::RetryPolicy;
use chatsync::{ChatId, CompanyRef, InMemoryRemote, Origin, UserId, Viewer};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// A backend with one student, one recruiter and a few conversations
pub struct World {
    pub remote: Arc<InMemoryRemote>,
    pub student: UserId,
    pub other_student: UserId,
    pub recruiter: UserId,
    pub company: u64,
    /// Student <-> Acme about the internship
    pub internship: ChatId,
    /// Student <-> Acme about a second job
    pub backend_job: ChatId,
    /// Acme reached out about the student's resume
    pub outreach: ChatId,
    /// Another student's chat with Acme
    pub foreign: ChatId,
    /// Job chat with a company that has no profile record
    pub orphan: ChatId,
}

pub fn world() -> World {
    let remote = Arc::new(InMemoryRemote::new());
    let student = remote.add_user("Ada", "Lovelace", None);
    let other_student = remote.add_user("Grace", "Hopper", None);
    let recruiter = remote.add_user("Rita", "Hire", Some("https://cdn.example.com/rita.png"));
    let company = remote.add_company(recruiter, "Acme");

    let internship_job = remote.add_job(CompanyRef::Id(company), "Rust Intern");
    let second_job = remote.add_job(CompanyRef::Id(company), "Backend Developer");
    let orphan_job = remote.add_job(CompanyRef::Id(9_999), "Ghost Job");

    let internship = remote.add_chat(Origin::JobApplication(
        remote.add_job_application(student, internship_job),
    ));
    let backend_job = remote.add_chat(Origin::JobApplication(
        remote.add_job_application(student, second_job),
    ));
    let resume = remote.add_resume(student, Some("Data Analyst"));
    let outreach = remote.add_chat(Origin::ResumeApplication(remote.add_resume_application(
        resume,
        company,
        Some("We liked your resume"),
    )));
    let foreign = remote.add_chat(Origin::JobApplication(
        remote.add_job_application(other_student, internship_job),
    ));
    let orphan = remote.add_chat(Origin::JobApplication(
        remote.add_job_application(student, orphan_job),
    ));

    World {
        remote,
        student,
        other_student,
        recruiter,
        company,
        internship,
        backend_job,
        outreach,
        foreign,
        orphan,
    }
}

pub fn options() -> EngineOptions {
    EngineOptions {
        retry: RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(50),
        },
        ..EngineOptions::default()
    }
}

pub fn engine(world: &World, viewer: Viewer) -> Arc<ChatEngine> {
    setup_logging();
    ChatEngine::new(world.remote.clone(), viewer, options()).expect("engine should build")
}

pub fn student_engine(world: &World) -> Arc<ChatEngine> {
    engine(world, Viewer::Student(world.student))
}

pub fn company_engine(world: &World) -> Arc<ChatEngine> {
    engine(world, Viewer::Company(world.recruiter))
}
