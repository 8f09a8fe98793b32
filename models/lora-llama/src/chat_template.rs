use std::fmt::Display;

use chat_language_model::Turn;
use minijinja::{context, Environment, ErrorKind};
use minijinja_contrib::pycompat;

#[cfg(test)]
use pretty_assertions::assert_eq;

/// The chat template Llama 2 chat models ship with. Used when a tokenizer does not carry its own.
pub const LLAMA_2_CHAT_TEMPLATE: &str = r#"{% if messages[0]['role'] == 'system' %}{% set loop_messages = messages[1:] %}{% set system_message = messages[0]['content'] %}{% else %}{% set loop_messages = messages %}{% set system_message = false %}{% endif %}{% for message in loop_messages %}{% if (message['role'] == 'user') != (loop.index0 % 2 == 0) %}{{ raise_exception('Conversation roles must alternate user/assistant/user/assistant/...') }}{% endif %}{% if loop.index0 == 0 and system_message != false %}{% set content = '<<SYS>>\n' + system_message + '\n<</SYS>>\n\n' + message['content'] %}{% else %}{% set content = message['content'] %}{% endif %}{% if message['role'] == 'user' %}{{ bos_token + '[INST] ' + content.strip() + ' [/INST]' }}{% elif message['role'] == 'assistant' %}{{ ' '  + content.strip() + ' ' + eos_token }}{% endif %}{% endfor %}"#;

/// An error that can occur while compiling or rendering a chat template.
#[derive(Debug, thiserror::Error)]
pub enum ChatTemplateError {
    /// The template is not valid Jinja.
    #[error("Failed to compile chat template: {0}")]
    Compile(#[source] minijinja::Error),
    /// The template failed while rendering, or raised an exception itself.
    #[error("Failed to render chat template: {0}")]
    Render(#[source] minijinja::Error),
}

/// A compiled Hugging Face chat template.
#[derive(Debug)]
pub(crate) struct HuggingFaceChatTemplate {
    environment: Environment<'static>,
}

impl HuggingFaceChatTemplate {
    pub(crate) fn create(chat_template: impl Display) -> Result<Self, ChatTemplateError> {
        let chat_template = chat_template.to_string();
        let mut environment = Environment::new();

        // enable python compatibility methods because most models are tested with python
        environment.set_unknown_method_callback(pycompat::unknown_method_callback);

        // add the raise_exception function from huggingface templates to the environment
        let raise_exception = |err_text: String| -> Result<String, minijinja::Error> {
            Err(minijinja::Error::new(
                ErrorKind::InvalidOperation,
                format!("The template raised an exception: {}", err_text),
            ))
        };
        environment.add_function("raise_exception", raise_exception);

        // compile the template expression in the environment
        environment
            .add_template_owned("main", chat_template)
            .map_err(ChatTemplateError::Compile)?;

        Ok(Self { environment })
    }

    pub(crate) fn render(
        &self,
        bos_token: &str,
        eos_token: &str,
        messages: &[Turn],
        add_generation_prompt: bool,
    ) -> Result<String, ChatTemplateError> {
        let ctx = context! { bos_token, eos_token, messages, add_generation_prompt };
        let template = self
            .environment
            .get_template("main")
            .map_err(ChatTemplateError::Render)?;
        template.render(&ctx).map_err(ChatTemplateError::Render)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_language_model::Role;

    fn conversation() -> Vec<Turn> {
        vec![
            Turn::new(Role::User, "Hello, how are you?"),
            Turn::new(Role::Assistant, "I'm doing great. How can I help you today?"),
            Turn::new(Role::User, "I'd like to show off how chat templating works!"),
        ]
    }

    #[test]
    fn llama_2_template_folds_the_system_prompt_into_the_first_turn() {
        let template = HuggingFaceChatTemplate::create(LLAMA_2_CHAT_TEMPLATE).unwrap();
        let mut inputs = vec![Turn::new(Role::System, "Be kind.")];
        inputs.extend(conversation());

        let result = template.render("<s>", "</s>", &inputs, false).unwrap();
        assert_eq!(
            result,
            "<s>[INST] <<SYS>>\nBe kind.\n<</SYS>>\n\nHello, how are you? [/INST] I'm doing great. How can I help you today? </s><s>[INST] I'd like to show off how chat templating works! [/INST]"
        );
    }

    #[test]
    fn llama_2_template_without_a_system_prompt() {
        let template = HuggingFaceChatTemplate::create(LLAMA_2_CHAT_TEMPLATE).unwrap();
        let result = template
            .render("<s>", "</s>", &conversation()[..1], false)
            .unwrap();
        assert_eq!(result, "<s>[INST] Hello, how are you? [/INST]");
    }

    #[test]
    fn llama_2_template_rejects_turns_out_of_order() {
        let template = HuggingFaceChatTemplate::create(LLAMA_2_CHAT_TEMPLATE).unwrap();
        let inputs = [
            Turn::new(Role::User, "one"),
            Turn::new(Role::User, "two"),
        ];
        assert!(matches!(
            template.render("<s>", "</s>", &inputs, false),
            Err(ChatTemplateError::Render(_))
        ));
    }

    #[test]
    fn rendering_is_a_pure_function_of_the_turns() {
        let template = HuggingFaceChatTemplate::create(LLAMA_2_CHAT_TEMPLATE).unwrap();
        let inputs = conversation();
        assert_eq!(
            template.render("<s>", "</s>", &inputs, false).unwrap(),
            template.render("<s>", "</s>", &inputs, false).unwrap()
        );
    }

    #[test]
    fn llama_3_template() {
        let template = "{% set loop_messages = messages %}{% for message in loop_messages %}{% set content = '<|start_header_id|>' + message['role'] + '<|end_header_id|>\n\n'+ message['content'] | trim + '<|eot_id|>' %}{% if loop.index0 == 0 %}{% set content = bos_token + content %}{% endif %}{{ content }}{% endfor %}{% if add_generation_prompt %}{{ '<|start_header_id|>assistant<|end_header_id|>\n\n' }}{% endif %}";
        let template = HuggingFaceChatTemplate::create(template).unwrap();

        let result = template
            .render(
                "<|begin_of_text|>",
                "<|end_of_text|>",
                &conversation(),
                true,
            )
            .unwrap();

        assert_eq!(
            result,
            r#"<|begin_of_text|><|start_header_id|>user<|end_header_id|>

Hello, how are you?<|eot_id|><|start_header_id|>assistant<|end_header_id|>

I'm doing great. How can I help you today?<|eot_id|><|start_header_id|>user<|end_header_id|>

I'd like to show off how chat templating works!<|eot_id|><|start_header_id|>assistant<|end_header_id|>

"#
        )
    }

    #[test]
    fn invalid_templates_fail_to_compile() {
        assert!(matches!(
            HuggingFaceChatTemplate::create("{% for message in messages %}"),
            Err(ChatTemplateError::Compile(_))
        ));
    }
}
